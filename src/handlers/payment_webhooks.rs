use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::{
    errors::ServiceError,
    services::order_materializer::MaterializationOutcome,
    webhooks::{PaymentEvent, WebhookError, SIGNATURE_HEADER},
    AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
}

fn reject(err: WebhookError) -> ServiceError {
    counter!("checkout.webhook_rejected", 1);
    warn!(error = %err, "Rejected payment webhook");
    ServiceError::WebhookSignature(err.to_string())
}

// POST /api/v1/webhooks/payments
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/payments",
    request_body(content = String, description = "Raw event body exactly as signed", content_type = "application/json"),
    params(("stripe-signature" = String, Header, description = "t=<timestamp>,v1=<hex hmac>")),
    responses(
        (status = 200, description = "Event accepted", body = WebhookAck),
        (status = 400, description = "Signature verification failed", body = crate::errors::ErrorResponse),
        (status = 500, description = "Orders could not be created; the event will be redelivered", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let verifier = state
        .webhook_verifier
        .as_ref()
        .ok_or_else(|| reject(WebhookError::SecretNotConfigured))?;

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let event = verifier.construct_event(signature, &body).map_err(reject)?;

    match event {
        PaymentEvent::PaymentSucceeded {
            event_id,
            payment_intent_id,
            session_id,
            user_id,
        } => {
            info!(
                event_id = event_id.as_deref().unwrap_or("-"),
                payment_intent_id = payment_intent_id.as_deref().unwrap_or("-"),
                %session_id,
                "Payment succeeded"
            );
            let outcome = state
                .services
                .materializer
                .materialize(session_id, &user_id)
                .await
                .map_err(|e| {
                    counter!("checkout.materialization_failed", 1);
                    error!(error = %e, %session_id, "Order materialization failed");
                    e
                })?;
            if let MaterializationOutcome::Materialized { order_ids } = outcome {
                info!(%session_id, orders = order_ids.len(), "Orders created from payment");
            }
        }
        PaymentEvent::Other {
            event_id,
            event_type,
        } => {
            debug!(
                event_id = event_id.as_deref().unwrap_or("-"),
                event_type = %event_type,
                "Ignoring payment event"
            );
        }
    }

    Ok(Json(WebhookAck { received: true }))
}
