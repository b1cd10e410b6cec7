#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use marketplace_checkout::{
    auth::{JwtAuth, Role},
    config::AppConfig,
    db,
    entities::{discount_code, product, seller, shop, user},
    events::{self, EventSender},
    handlers::AppServices,
    notifications::LogMailer,
    payments::PaymentGateway,
    session_store::{InMemorySessionStore, SessionStore},
    webhooks::{WebhookVerifier, SIGNATURE_HEADER},
    AppState,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Database, Set};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_integration_secret";
pub const BUYER: &str = "u1";
pub const OTHER_BUYER: &str = "u2";
pub const SELLER: &str = "seller-1";
pub const ADMIN: &str = "admin";
pub const COUPON_CODE: &str = "MUGMANIA";

/// Helper harness for spinning up an application state backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub sessions: Arc<InMemorySessionStore>,
    verifier: WebhookVerifier,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_gateway(None).await
    }

    /// Construct a test application with fresh database state and the given
    /// payment processor client.
    pub async fn with_gateway(gateway: Option<Arc<dyn PaymentGateway>>) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "redis://127.0.0.1:6379".to_string(),
            "test_secret_key_for_testing_purposes_only_32chars".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.session_store_backend = "in-memory".to_string();
        cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        cfg.admin_receiver_id = ADMIN.to_string();

        let pool = Database::connect(cfg.database_url())
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        seed(&pool).await;

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let sessions = Arc::new(InMemorySessionStore::new());
        let session_store: Arc<dyn SessionStore> = sessions.clone();
        let services = AppServices::new(
            &cfg,
            db_arc.clone(),
            session_store.clone(),
            gateway,
            Arc::new(LogMailer),
            event_sender.clone(),
        );

        let verifier = WebhookVerifier::new(WEBHOOK_SECRET, cfg.payment_webhook_tolerance_secs);
        let state = AppState {
            db: db_arc,
            config: cfg.clone(),
            event_sender,
            sessions: session_store,
            jwt: Arc::new(JwtAuth::new(&cfg.jwt_secret)),
            webhook_verifier: Some(verifier.clone()),
            services,
        };

        Self {
            router: marketplace_checkout::app_router(state.clone()),
            state,
            sessions,
            verifier,
            _event_task: event_task,
        }
    }

    /// Bearer token for `subject` with `role`.
    pub fn token(&self, subject: &str, role: Role) -> String {
        self.state
            .jwt
            .issue(subject, role, ChronoDuration::hours(1))
            .expect("issue test token")
    }

    pub fn buyer_token(&self) -> String {
        self.token(BUYER, Role::User)
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Delivers a raw webhook body with an optional signature header.
    pub async fn deliver_webhook(&self, payload: &[u8], signature: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/webhooks/payments")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }

        let request = builder
            .body(Body::from(payload.to_vec()))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Signs and delivers a `payment_intent.succeeded` event for the session.
    pub async fn deliver_payment_succeeded(&self, session_id: &str, user_id: &str) -> Response {
        let payload = payment_succeeded_payload(session_id, user_id);
        let signature = self
            .verifier
            .sign(&payload, Utc::now().timestamp())
            .expect("sign webhook");
        self.deliver_webhook(&payload, Some(&signature)).await
    }

    /// Opens a checkout session as the default buyer and returns its id.
    pub async fn open_session(&self, payload: Value) -> String {
        let response = self
            .request(
                Method::POST,
                "/api/v1/checkout/sessions",
                Some(payload),
                Some(&self.buyer_token()),
            )
            .await;
        assert_eq!(response.status(), 201);
        let body = response_json(response).await;
        body["sessionId"]
            .as_str()
            .expect("session id in response")
            .to_string()
    }

    pub async fn product(&self, id: &str) -> product::Model {
        use sea_orm::EntityTrait;
        product::Entity::find_by_id(id.to_string())
            .one(&*self.state.db)
            .await
            .expect("query product")
            .expect("seeded product")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// Two sellers with one shop and one product each; the Mug accepts the
/// 150% coupon.
async fn seed(db: &sea_orm::DatabaseConnection) {
    let now = Utc::now();
    for (seller_id, shop_id, product_id, title, price, coupon_ids) in [
        ("seller-1", "s1", "p1", "Mug", dec!(100), json!(["dc-1"])),
        ("seller-2", "s2", "p2", "Lamp", dec!(50), json!([])),
    ] {
        seller::ActiveModel {
            id: Set(seller_id.into()),
            name: Set(seller_id.into()),
            email: Set(format!("{}@example.com", seller_id)),
            stripe_id: Set(Some(format!("acct_{}", shop_id))),
            created_at: Set(now),
        }
        .insert(db)
        .await
        .expect("seed seller");
        shop::ActiveModel {
            id: Set(shop_id.into()),
            seller_id: Set(seller_id.into()),
            name: Set(format!("{} shop", title)),
            created_at: Set(now),
        }
        .insert(db)
        .await
        .expect("seed shop");
        product::ActiveModel {
            id: Set(product_id.into()),
            shop_id: Set(shop_id.into()),
            title: Set(title.into()),
            sale_price: Set(price),
            stock: Set(10),
            total_sales: Set(0),
            discount_codes: Set(coupon_ids),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(db)
        .await
        .expect("seed product");
    }

    for (id, name) in [(BUYER, "Grace"), (OTHER_BUYER, "Alan")] {
        user::ActiveModel {
            id: Set(id.into()),
            name: Set(name.into()),
            email: Set(Some(format!("{}@example.com", id))),
            created_at: Set(now),
        }
        .insert(db)
        .await
        .expect("seed user");
    }

    discount_code::ActiveModel {
        id: Set("dc-1".into()),
        seller_id: Set("seller-1".into()),
        public_name: Set("Mug mania".into()),
        discount_code: Set(COUPON_CODE.into()),
        discount_type: Set("percentage".into()),
        discount_value: Set(dec!(150)),
        created_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed discount code");
}

pub fn cart_line(product_id: &str, shop_id: &str, quantity: i32, price: Decimal) -> Value {
    json!({
        "id": product_id,
        "quantity": quantity,
        "sale_price": price,
        "shopId": shop_id,
        "selectedOptions": {}
    })
}

/// Mug x2 from s1 and Lamp x1 from s2.
pub fn two_shop_cart() -> Value {
    json!([
        cart_line("p1", "s1", 2, dec!(100)),
        cart_line("p2", "s2", 1, dec!(50))
    ])
}

pub fn payment_succeeded_payload(session_id: &str, user_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": "payment_intent.succeeded",
        "data": {"object": {
            "id": "pi_test",
            "metadata": {"sessionId": session_id, "userId": user_id}
        }}
    }))
    .expect("serialize webhook payload")
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Reads a decimal that may be serialized as a string or a number.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("expected decimal, got {other}"),
    }
}
