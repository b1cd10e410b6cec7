//! Marketplace Checkout Library
//!
//! Payment sessions, payment intents and webhook-driven order materialization
//! for a multi-shop marketplace.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod cart;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod notifications;
pub mod openapi;
pub mod payments;
pub mod services;
pub mod session_store;
pub mod tracing;
pub mod webhooks;

use axum::{
    extract::FromRef,
    routing::{get, post, put},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::{auth::JwtAuth, session_store::SessionStore, webhooks::WebhookVerifier};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub sessions: Arc<dyn SessionStore>,
    pub jwt: Arc<JwtAuth>,
    /// `None` when no webhook secret is configured; every delivery is then rejected
    pub webhook_verifier: Option<WebhookVerifier>,
    pub services: handlers::AppServices,
}

impl FromRef<AppState> for Arc<JwtAuth> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

pub fn api_v1_routes() -> Router<AppState> {
    let checkout = Router::new()
        .route(
            "/checkout/sessions",
            post(handlers::checkout::create_payment_session)
                .get(handlers::checkout::get_payment_session),
        )
        .route("/coupons/verify", put(handlers::coupons::verify_coupon));

    let payments = Router::new().route(
        "/payments/intents",
        post(handlers::payments::create_payment_intent),
    );

    // Payment webhook (does not require auth, but signature-verified)
    let payment_webhook = Router::new().route(
        "/webhooks/payments",
        post(handlers::payment_webhooks::payment_webhook),
    );

    let orders = Router::new()
        .route("/orders", get(handlers::orders::list_all_orders))
        .route("/orders/mine", get(handlers::orders::list_my_orders))
        .route("/orders/shop", get(handlers::orders::list_shop_orders))
        .route("/orders/:order_id", get(handlers::orders::get_order_details))
        .route(
            "/orders/:order_id/delivery-status",
            put(handlers::orders::update_delivery_status),
        );

    let analytics = Router::new().route(
        "/analytics/events",
        post(handlers::analytics::track_event),
    );

    Router::new()
        .merge(checkout)
        .merge(payments)
        .merge(payment_webhook)
        .merge(orders)
        .merge(analytics)
}

/// Full application router without the CORS layer, which depends on
/// deployment configuration.
pub fn app_router(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/", get(|| async { "marketplace-checkout up" }))
        .route("/health", get(handlers::health::liveness_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_ui())
        // HTTP tracing layer for consistent request/response telemetry
        .layer(crate::tracing::configure_http_tracing())
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}

pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::db::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::services::*;
    pub use crate::tracing::*;
}
