use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info, instrument};

use super::{PaymentGateway, PaymentIntent, PaymentIntentRequest};
use crate::errors::ServiceError;

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Creates destination-charge payment intents through the Stripe REST API.
#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(api_base: impl Into<String>, secret_key: impl Into<String>) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, request), fields(session_id = %request.session_id, amount_minor = request.amount_minor))]
    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, ServiceError> {
        let session_id = request.session_id.to_string();
        let amount = request.amount_minor.to_string();
        let fee = request.application_fee_minor.to_string();
        let form: [(&str, &str); 7] = [
            ("amount", amount.as_str()),
            ("currency", request.currency.as_str()),
            ("payment_method_types[]", "card"),
            ("application_fee_amount", fee.as_str()),
            ("transfer_data[destination]", request.destination_account.as_str()),
            ("metadata[sessionId]", session_id.as_str()),
            ("metadata[userId]", request.user_id.as_str()),
        ];

        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Payment intent request failed");
                ServiceError::PaymentGateway(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<StripeErrorBody>()
                .await
                .ok()
                .map(|body| {
                    format!(
                        "{}: {}",
                        body.error.kind.unwrap_or_else(|| "api_error".to_string()),
                        body.error.message.unwrap_or_default()
                    )
                })
                .unwrap_or_else(|| status.to_string());
            error!(%status, detail = %detail, "Payment processor rejected payment intent");
            return Err(ServiceError::PaymentGateway(detail));
        }

        let intent: PaymentIntent = response.json().await.map_err(|e| {
            error!(error = %e, "Unreadable payment intent response");
            ServiceError::PaymentGateway(e.to_string())
        })?;

        info!(payment_intent_id = %intent.id, "Payment intent created");
        Ok(intent)
    }
}
