use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    errors::ServiceError,
    services::payment_sessions::{CreateSessionRequest, CreateSessionResponse, SessionEnvelope},
    AppState,
};

#[derive(Debug, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    #[param(rename = "sessionId")]
    pub session_id: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout/sessions",
    summary = "Open payment session",
    description = "Opens a payment session for the caller's cart, or returns the pending one when the cart is unchanged",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session opened or reused", body = CreateSessionResponse),
        (status = 400, description = "Empty or malformed cart, or inapplicable coupon", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 500, description = "Session store unavailable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn create_payment_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let opened = state
        .services
        .payment_sessions
        .create_session(&user.user_id, request)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: opened.session_id,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/checkout/sessions",
    summary = "Inspect payment session",
    params(SessionQuery),
    responses(
        (status = 200, description = "Live session", body = SessionEnvelope),
        (status = 400, description = "Session id is missing", body = crate::errors::ErrorResponse),
        (status = 403, description = "Session belongs to another buyer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Session not found or expired", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn get_payment_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SessionEnvelope>, ServiceError> {
    let raw = query
        .session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ServiceError::ValidationError("Session id is missing".to_string()))?;
    let session_id = Uuid::parse_str(raw.trim())
        .map_err(|_| ServiceError::NotFound("Session not found or expired".to_string()))?;

    let session = state.services.payment_sessions.get_session(session_id).await?;
    if session.user_id != user.user_id && !user.is_admin() {
        return Err(ServiceError::Forbidden(
            "Session belongs to another buyer".to_string(),
        ));
    }

    Ok(Json(SessionEnvelope {
        success: true,
        session,
    }))
}
