use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::{
    auth::AuthenticatedUser, errors::ServiceError, services::analytics::TrackEventRequest,
    AppState,
};

#[utoipa::path(
    post,
    path = "/api/v1/analytics/events",
    summary = "Track browsing action",
    request_body = TrackEventRequest,
    responses(
        (status = 202, description = "Action recorded"),
        (status = 400, description = "Unknown action kind", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Analytics"
)]
pub async fn track_event(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<TrackEventRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    state.services.analytics.track(&user.user_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "success": true }))))
}
