//! Outbound payment-processor integration: fee split and payment intents.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::ServiceError;

mod stripe;

pub use self::stripe::StripeGateway;

/// Customer charge and platform share, in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub amount_minor: i64,
    pub application_fee_minor: i64,
}

/// `amount_minor = round(amount * 100)`,
/// `application_fee_minor = floor(amount_minor * fee_percent / 100)`.
pub fn split_amount(amount: Decimal, fee_percent: u32) -> Result<FeeSplit, ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError("Invalid amount".to_string()));
    }

    let amount_minor = amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|minor| minor.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|minor| minor.to_i64())
        .filter(|minor| *minor > 0)
        .ok_or_else(|| ServiceError::ValidationError("Invalid amount".to_string()))?;

    let application_fee_minor = amount_minor
        .checked_mul(i64::from(fee_percent))
        .map(|fee| fee / 100)
        .ok_or_else(|| ServiceError::ValidationError("Amount out of range".to_string()))?;

    Ok(FeeSplit {
        amount_minor,
        application_fee_minor,
    })
}

/// Accepts a JSON number or numeric string, as storefronts send either.
pub fn parse_amount(raw: &Value) -> Result<Decimal, ServiceError> {
    let invalid = || ServiceError::ValidationError("Invalid amount".to_string());
    match raw {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .map_err(|_| invalid()),
        Value::String(s) => Decimal::from_str(s.trim()).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentRequest {
    pub amount_minor: i64,
    pub application_fee_minor: i64,
    pub currency: String,
    /// Seller's connected payout account
    pub destination_account: String,
    pub session_id: Uuid,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, ServiceError>;
}
