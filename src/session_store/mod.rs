//! Short-lived payment sessions bridging checkout initiation and the
//! processor's asynchronous payment confirmation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cart::CartLine;
use crate::services::coupons::DiscountType;

mod memory;
mod redis_store;

pub use self::memory::InMemorySessionStore;
pub use self::redis_store::RedisSessionStore;

pub(crate) const SESSION_KEY_PREFIX: &str = "payment-session";
const BUYER_INDEX_PREFIX: &str = "payment-session-buyer";
const CLAIM_KEY_PREFIX: &str = "payment-session-claim";

pub fn session_key(session_id: Uuid) -> String {
    format!("{}:{}", SESSION_KEY_PREFIX, session_id)
}

pub fn buyer_index_key(buyer_id: &str) -> String {
    format!("{}:{}", BUYER_INDEX_PREFIX, buyer_id)
}

pub fn claim_key(session_id: Uuid) -> String {
    format!("{}:{}", CLAIM_KEY_PREFIX, session_id)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session store unavailable: {0}")]
    Unavailable(String),
    #[error("Corrupt session record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coupon validated at session creation and applied at materialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponSnapshot {
    pub code: String,
    pub discount_type: DiscountType,
    #[schema(value_type = f64)]
    pub discount_value: Decimal,
    /// Quoted discount for the bound line at session creation
    #[schema(value_type = f64)]
    pub discount_amount: Decimal,
    /// Product id of the cart line the coupon applies to
    pub discounted_line_id: String,
}

/// A buyer's intended purchase, held until the processor confirms payment or
/// the record expires.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub session_id: Uuid,
    /// Owning buyer
    pub user_id: String,
    pub cart: Vec<CartLine>,
    /// shopId → connected payout account, resolved when the session was opened
    pub seller_payout_targets: BTreeMap<String, String>,
    #[schema(value_type = f64)]
    pub total_amount: Decimal,
    pub shipping_address_id: Option<String>,
    pub coupon: Option<CouponSnapshot>,
    pub created_at: DateTime<Utc>,
}

/// Storage for payment sessions. Implementations keep a buyer → session
/// index in step with the session record and expire both together.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Writes the session and points the buyer index at it, atomically. A
    /// different session the index pointed at is deleted in the same step and
    /// its id returned, so a buyer never holds two confirmable sessions.
    async fn save(
        &self,
        session: &PaymentSession,
        ttl: Duration,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn load(&self, session_id: Uuid) -> Result<Option<PaymentSession>, StoreError>;

    /// The buyer's live session, if the index points at one that still exists.
    async fn pending_for_buyer(&self, buyer_id: &str)
        -> Result<Option<PaymentSession>, StoreError>;

    /// Deletes the session; the buyer index is cleared only if it still
    /// points at this session.
    async fn remove(&self, session: &PaymentSession) -> Result<(), StoreError>;

    /// Takes the exclusive materialization claim. `false` means another
    /// delivery holds it.
    async fn try_claim(&self, session_id: Uuid, ttl: Duration) -> Result<bool, StoreError>;

    async fn release_claim(&self, session_id: Uuid) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
