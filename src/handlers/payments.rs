use axum::{extract::State, Json};

use crate::{
    auth::AuthenticatedUser,
    errors::ServiceError,
    services::payment_sessions::{CreatePaymentIntentRequest, PaymentIntentResponse},
    AppState,
};

#[utoipa::path(
    post,
    path = "/api/v1/payments/intents",
    summary = "Create payment intent",
    description = "Creates a destination charge for a live session, keeping the platform fee",
    request_body = CreatePaymentIntentRequest,
    responses(
        (status = 200, description = "Client secret for the payment form", body = PaymentIntentResponse),
        (status = 400, description = "Invalid amount or missing seller account", body = crate::errors::ErrorResponse),
        (status = 403, description = "Session belongs to another buyer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Session not found or expired", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment processor rejected the request", body = crate::errors::ErrorResponse),
        (status = 503, description = "Payment processing is not configured", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn create_payment_intent(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreatePaymentIntentRequest>,
) -> Result<Json<PaymentIntentResponse>, ServiceError> {
    let response = state
        .services
        .payment_sessions
        .create_payment_intent(&user.user_id, request)
        .await?;
    Ok(Json(response))
}
