use chrono::Utc;
use metrics::counter;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    cart::{self, CartLine},
    entities::{seller, shop},
    errors::ServiceError,
    events::{Event, EventSender},
    payments::{parse_amount, split_amount, PaymentGateway, PaymentIntentRequest},
    services::coupons::CouponService,
    session_store::{PaymentSession, SessionStore},
};

/// Coupon as sent by the storefront: either the bare code or the object
/// returned by coupon verification. Only the code is trusted.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum CouponInput {
    Code(String),
    Details { code: String },
}

impl CouponInput {
    pub fn code(&self) -> &str {
        match self {
            Self::Code(code) | Self::Details { code } => code,
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub cart: Vec<CartLine>,
    pub selected_address_id: Option<String>,
    pub coupon: Option<CouponInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionEnvelope {
    pub success: bool,
    pub session: PaymentSession,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentRequest {
    /// Charge amount in major units, as a number or numeric string
    #[schema(value_type = f64)]
    pub amount: Value,
    pub seller_stripe_account_id: Option<String>,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentResponse {
    pub client_secret: String,
}

/// Result of opening a checkout session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedSession {
    pub session_id: Uuid,
    /// An equivalent pending session was returned instead of a new one
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub session_ttl: Duration,
    pub platform_fee_percent: u32,
    pub currency: String,
}

/// Opens, inspects and pays for buyer checkout sessions.
#[derive(Clone)]
pub struct PaymentSessionService {
    db: Arc<DatabaseConnection>,
    store: Arc<dyn SessionStore>,
    coupons: CouponService,
    gateway: Option<Arc<dyn PaymentGateway>>,
    event_sender: EventSender,
    settings: CheckoutSettings,
}

impl PaymentSessionService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: Arc<dyn SessionStore>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        event_sender: EventSender,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            coupons: CouponService::new(db.clone()),
            db,
            store,
            gateway,
            event_sender,
            settings,
        }
    }

    /// Opens a payment session for `user_id`, or hands back the buyer's
    /// pending one when it holds the same cart, address and coupon.
    ///
    /// A pending session for anything else is discarded once the new one is
    /// stored, so it can no longer be confirmed.
    #[instrument(skip(self, request), fields(cart_lines = request.cart.len()))]
    pub async fn create_session(
        &self,
        user_id: &str,
        request: CreateSessionRequest,
    ) -> Result<OpenedSession, ServiceError> {
        cart::validate(&request.cart)?;
        let fingerprint = cart::fingerprint(&request.cart)?;
        let coupon_code = request
            .coupon
            .as_ref()
            .map(|c| c.code().trim().to_string())
            .filter(|c| !c.is_empty());

        if let Some(pending) = self.store.pending_for_buyer(user_id).await? {
            let same_cart = cart::fingerprint(&pending.cart)? == fingerprint;
            let same_coupon =
                pending.coupon.as_ref().map(|c| c.code.as_str()) == coupon_code.as_deref();
            let same_address = pending.shipping_address_id == request.selected_address_id;

            if same_cart && same_coupon && same_address {
                counter!("checkout.sessions_reused", 1);
                self.event_sender
                    .send_or_log(Event::PaymentSessionReused {
                        session_id: pending.session_id,
                        user_id: user_id.to_string(),
                    })
                    .await;
                return Ok(OpenedSession {
                    session_id: pending.session_id,
                    reused: true,
                });
            }
        }

        // Everything that can reject the request runs before the pending
        // session is touched, so a refused checkout leaves it payable.
        let coupon = match coupon_code {
            Some(code) => Some(self.coupons.snapshot(&code, &request.cart).await?),
            None => None,
        };

        let seller_payout_targets = self.resolve_payout_targets(&request.cart).await?;

        let session = PaymentSession {
            session_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            total_amount: cart::total_amount(&request.cart),
            cart: request.cart,
            seller_payout_targets,
            shipping_address_id: request.selected_address_id,
            coupon,
            created_at: Utc::now(),
        };

        let displaced = self.store.save(&session, self.settings.session_ttl).await?;
        if let Some(superseded) = displaced {
            info!(session_id = %superseded, "Superseded pending payment session");
            self.event_sender
                .send_or_log(Event::PaymentSessionSuperseded {
                    session_id: superseded,
                    user_id: user_id.to_string(),
                })
                .await;
        }

        counter!("checkout.sessions_created", 1);
        info!(session_id = %session.session_id, total = %session.total_amount, "Payment session created");
        self.event_sender
            .send_or_log(Event::PaymentSessionCreated {
                session_id: session.session_id,
                user_id: user_id.to_string(),
            })
            .await;

        Ok(OpenedSession {
            session_id: session.session_id,
            reused: false,
        })
    }

    /// shopId → seller payout account, for every shop whose seller has one.
    async fn resolve_payout_targets(
        &self,
        lines: &[CartLine],
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        let shop_ids = cart::shop_ids(lines);
        let shops = shop::Entity::find()
            .filter(shop::Column::Id.is_in(shop_ids.clone()))
            .find_also_related(seller::Entity)
            .all(&*self.db)
            .await?;

        let mut targets = BTreeMap::new();
        for (shop, seller) in shops {
            match seller.and_then(|s| s.stripe_id) {
                Some(account) => {
                    targets.insert(shop.id, account);
                }
                None => warn!(shop_id = %shop.id, "Shop has no connected payout account"),
            }
        }

        for shop_id in shop_ids.iter().filter(|id| !targets.contains_key(*id)) {
            warn!(shop_id = %shop_id, "Cart references a shop without payout target");
        }

        Ok(targets)
    }

    #[instrument(skip(self))]
    pub async fn get_session(&self, session_id: Uuid) -> Result<PaymentSession, ServiceError> {
        self.store
            .load(session_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Session not found or expired".to_string()))
    }

    /// Creates a processor payment intent for a live session owned by `user_id`.
    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    pub async fn create_payment_intent(
        &self,
        user_id: &str,
        request: CreatePaymentIntentRequest,
    ) -> Result<PaymentIntentResponse, ServiceError> {
        let amount = parse_amount(&request.amount)?;
        let destination = request
            .seller_stripe_account_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::ValidationError("Missing seller Stripe account ID".to_string())
            })?;

        let session = self.get_session(request.session_id).await?;
        if session.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "Session belongs to another buyer".to_string(),
            ));
        }
        if !session
            .seller_payout_targets
            .values()
            .any(|account| *account == destination)
        {
            return Err(ServiceError::ValidationError(
                "Seller account is not part of this checkout".to_string(),
            ));
        }

        let split = split_amount(amount, self.settings.platform_fee_percent)?;
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            ServiceError::ServiceUnavailable("Payment processing is not configured".to_string())
        })?;

        let intent = gateway
            .create_payment_intent(&PaymentIntentRequest {
                amount_minor: split.amount_minor,
                application_fee_minor: split.application_fee_minor,
                currency: self.settings.currency.clone(),
                destination_account: destination,
                session_id: session.session_id,
                user_id: user_id.to_string(),
            })
            .await?;

        Ok(PaymentIntentResponse {
            client_secret: intent.client_secret,
        })
    }
}
