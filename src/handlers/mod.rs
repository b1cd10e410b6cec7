pub mod analytics;
pub mod checkout;
pub mod coupons;
pub mod health;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    notifications::Mailer,
    payments::PaymentGateway,
    services::{
        analytics::AnalyticsService,
        coupons::CouponService,
        order_materializer::{MaterializerSettings, OrderMaterializer},
        orders::OrderService,
        payment_sessions::{CheckoutSettings, PaymentSessionService},
    },
    session_store::SessionStore,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub payment_sessions: Arc<PaymentSessionService>,
    pub materializer: Arc<OrderMaterializer>,
    pub orders: Arc<OrderService>,
    pub coupons: Arc<CouponService>,
    pub analytics: Arc<AnalyticsService>,
}

impl AppServices {
    pub fn new(
        config: &AppConfig,
        db_pool: Arc<DbPool>,
        sessions: Arc<dyn SessionStore>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        mailer: Arc<dyn Mailer>,
        event_sender: EventSender,
    ) -> Self {
        let payment_sessions = Arc::new(PaymentSessionService::new(
            db_pool.clone(),
            sessions.clone(),
            gateway,
            event_sender.clone(),
            CheckoutSettings {
                session_ttl: config.payment_session_ttl(),
                platform_fee_percent: config.platform_fee_percent,
                currency: config.payment_currency.clone(),
            },
        ));

        let materializer = Arc::new(OrderMaterializer::new(
            db_pool.clone(),
            sessions,
            mailer,
            event_sender.clone(),
            MaterializerSettings {
                claim_ttl: config.materialization_claim_ttl(),
                admin_receiver_id: config.admin_receiver_id.clone(),
                storefront_base_url: config.storefront_base_url.trim_end_matches('/').to_string(),
            },
        ));

        Self {
            payment_sessions,
            materializer,
            orders: Arc::new(OrderService::new(db_pool.clone(), event_sender)),
            coupons: Arc::new(CouponService::new(db_pool.clone())),
            analytics: Arc::new(AnalyticsService::new(db_pool)),
        }
    }
}
