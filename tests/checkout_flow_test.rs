//! End-to-end checkout: session creation, webhook-driven order creation and
//! the guarantees around duplicate deliveries.

mod common;

use axum::http::Method;
use common::{
    decimal, response_json, two_shop_cart, TestApp, BUYER, COUPON_CODE, OTHER_BUYER,
};
use marketplace_checkout::{
    auth::Role,
    entities::{notification, order, order_item},
};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use uuid::Uuid;

// ==================== Session Tests ====================

#[tokio::test]
async fn identical_checkout_reuses_pending_session() {
    let app = TestApp::new().await;

    let first = app.open_session(json!({ "cart": two_shop_cart() })).await;
    // Same lines in another order are the same cart
    let reordered = json!([two_shop_cart()[1].clone(), two_shop_cart()[0].clone()]);
    let second = app.open_session(json!({ "cart": reordered })).await;

    assert_eq!(first, second);
    assert_eq!(app.sessions.len().await, 1);
}

#[tokio::test]
async fn changed_cart_supersedes_pending_session() {
    let app = TestApp::new().await;

    let first = app.open_session(json!({ "cart": two_shop_cart() })).await;
    let second = app
        .open_session(json!({ "cart": [common::cart_line("p2", "s2", 3, dec!(50))] }))
        .await;
    assert_ne!(first, second);

    let stale = app
        .request(
            Method::GET,
            &format!("/api/v1/checkout/sessions?sessionId={}", first),
            None,
            Some(&app.buyer_token()),
        )
        .await;
    assert_eq!(stale.status(), 404);

    let live = app
        .request(
            Method::GET,
            &format!("/api/v1/checkout/sessions?sessionId={}", second),
            None,
            Some(&app.buyer_token()),
        )
        .await;
    assert_eq!(live.status(), 200);
    let body = response_json(live).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["session"]["userId"], BUYER);
    assert_eq!(decimal(&body["session"]["totalAmount"]), dec!(150));
    assert_eq!(body["session"]["sellerPayoutTargets"]["s2"], "acct_s2");
}

#[tokio::test]
async fn session_lookup_validates_input_and_owner() {
    let app = TestApp::new().await;
    let session_id = app.open_session(json!({ "cart": two_shop_cart() })).await;

    let missing = app
        .request(
            Method::GET,
            "/api/v1/checkout/sessions",
            None,
            Some(&app.buyer_token()),
        )
        .await;
    assert_eq!(missing.status(), 400);
    let body = response_json(missing).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Session id is missing"));

    let unknown = app
        .request(
            Method::GET,
            &format!("/api/v1/checkout/sessions?sessionId={}", Uuid::new_v4()),
            None,
            Some(&app.buyer_token()),
        )
        .await;
    assert_eq!(unknown.status(), 404);

    let stranger = app
        .request(
            Method::GET,
            &format!("/api/v1/checkout/sessions?sessionId={}", session_id),
            None,
            Some(&app.token(OTHER_BUYER, Role::User)),
        )
        .await;
    assert_eq!(stranger.status(), 403);

    let unauthenticated = app
        .request(
            Method::GET,
            &format!("/api/v1/checkout/sessions?sessionId={}", session_id),
            None,
            None,
        )
        .await;
    assert_eq!(unauthenticated.status(), 401);
}

#[tokio::test]
async fn empty_cart_is_rejected() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/sessions",
            Some(json!({ "cart": [] })),
            Some(&app.buyer_token()),
        )
        .await;

    assert_eq!(response.status(), 400);
    assert_eq!(app.sessions.len().await, 0);
}

// ==================== Materialization Tests ====================

#[tokio::test]
async fn payment_creates_one_order_per_shop() {
    let app = TestApp::new().await;
    let session_id = app.open_session(json!({
        "cart": two_shop_cart(),
        "selectedAddressId": "addr-1"
    }))
    .await;

    let response = app.deliver_payment_succeeded(&session_id, BUYER).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response_json(response).await["received"], true);

    let orders = order::Entity::find().all(&*app.state.db).await.unwrap();
    assert_eq!(orders.len(), 2);
    let s1 = orders.iter().find(|o| o.shop_id == "s1").unwrap();
    let s2 = orders.iter().find(|o| o.shop_id == "s2").unwrap();
    assert_eq!(s1.total, dec!(200));
    assert_eq!(s2.total, dec!(50));
    assert_eq!(s1.user_id, BUYER);
    assert_eq!(s1.shipping_address_id.as_deref(), Some("addr-1"));
    assert_eq!(s1.delivery_status, order::DeliveryStatus::Ordered);

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(s1.id))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 2);

    let mug = app.product("p1").await;
    let lamp = app.product("p2").await;
    assert_eq!((mug.stock, mug.total_sales), (8, 2));
    assert_eq!((lamp.stock, lamp.total_sales), (9, 1));

    assert_eq!(app.sessions.len().await, 0);

    // One per seller plus one platform alert
    let notifications = notification::Entity::find()
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(notifications, 3);
}

#[tokio::test]
async fn duplicate_delivery_creates_orders_once() {
    let app = TestApp::new().await;
    let session_id = app.open_session(json!({ "cart": two_shop_cart() })).await;

    let first = app.deliver_payment_succeeded(&session_id, BUYER).await;
    let second = app.deliver_payment_succeeded(&session_id, BUYER).await;
    assert_eq!(first.status(), 200);
    assert_eq!(second.status(), 200);

    let orders = order::Entity::find().count(&*app.state.db).await.unwrap();
    assert_eq!(orders, 2);
    assert_eq!(app.product("p1").await.stock, 8);
}

#[tokio::test]
async fn concurrent_deliveries_create_orders_once() {
    let app = TestApp::new().await;
    let session_id = app.open_session(json!({ "cart": two_shop_cart() })).await;

    let (a, b) = tokio::join!(
        app.deliver_payment_succeeded(&session_id, BUYER),
        app.deliver_payment_succeeded(&session_id, BUYER)
    );
    assert_eq!(a.status(), 200);
    assert_eq!(b.status(), 200);

    let orders = order::Entity::find().count(&*app.state.db).await.unwrap();
    assert_eq!(orders, 2);
    assert_eq!(app.product("p2").await.total_sales, 1);
}

#[tokio::test]
async fn failed_materialization_is_retried_on_redelivery() {
    let app = TestApp::new().await;
    let session_id = app.open_session(json!({ "cart": two_shop_cart() })).await;

    app.state
        .db
        .execute_unprepared(
            "CREATE TRIGGER reject_s2_orders BEFORE INSERT ON orders \
             WHEN NEW.shop_id = 's2' BEGIN SELECT RAISE(ABORT, 'shop s2 unavailable'); END;",
        )
        .await
        .unwrap();

    let failed = app.deliver_payment_succeeded(&session_id, BUYER).await;
    assert_eq!(failed.status(), 500);
    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 0);
    assert_eq!(app.product("p1").await.stock, 10);
    assert_eq!(app.sessions.len().await, 1);

    app.state
        .db
        .execute_unprepared("DROP TRIGGER reject_s2_orders;")
        .await
        .unwrap();

    let retried = app.deliver_payment_succeeded(&session_id, BUYER).await;
    assert_eq!(retried.status(), 200);
    assert_eq!(order::Entity::find().count(&*app.state.db).await.unwrap(), 2);
    assert_eq!(app.product("p1").await.stock, 8);
}

#[tokio::test]
async fn coupon_is_clamped_to_the_discounted_line() {
    let app = TestApp::new().await;
    let session_id = app.open_session(json!({
        "cart": two_shop_cart(),
        "coupon": { "code": COUPON_CODE }
    }))
    .await;

    let response = app.deliver_payment_succeeded(&session_id, BUYER).await;
    assert_eq!(response.status(), 200);

    let orders = order::Entity::find().all(&*app.state.db).await.unwrap();
    let s1 = orders.iter().find(|o| o.shop_id == "s1").unwrap();
    let s2 = orders.iter().find(|o| o.shop_id == "s2").unwrap();

    // 150% of a 200 line never exceeds the line
    assert_eq!(s1.discount_amount, dec!(200));
    assert_eq!(s1.total, dec!(0));
    assert_eq!(s1.coupon_code.as_deref(), Some(COUPON_CODE));
    assert_eq!(s2.total, dec!(50));
    assert_eq!(s2.coupon_code, None);
}

#[tokio::test]
async fn unknown_coupon_blocks_session_creation() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/sessions",
            Some(json!({ "cart": two_shop_cart(), "coupon": "NOPE" })),
            Some(&app.buyer_token()),
        )
        .await;

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn refused_checkout_leaves_pending_session_payable() {
    let app = TestApp::new().await;
    let session_id = app.open_session(json!({ "cart": two_shop_cart() })).await;

    let refused = app
        .request(
            Method::POST,
            "/api/v1/checkout/sessions",
            Some(json!({ "cart": two_shop_cart(), "coupon": "BOGUS" })),
            Some(&app.buyer_token()),
        )
        .await;
    assert_eq!(refused.status(), 400);

    let lookup = app
        .request(
            Method::GET,
            &format!("/api/v1/checkout/sessions?sessionId={}", session_id),
            None,
            Some(&app.buyer_token()),
        )
        .await;
    assert_eq!(lookup.status(), 200);

    let response = app.deliver_payment_succeeded(&session_id, BUYER).await;
    assert_eq!(response.status(), 200);
    let orders = order::Entity::find().count(&*app.state.db).await.unwrap();
    assert_eq!(orders, 2);
}

#[tokio::test]
async fn out_of_range_prices_are_rejected() {
    let app = TestApp::new().await;
    let huge = json!([{
        "id": "p1",
        "quantity": 2,
        "sale_price": "79228162514264337593543950335",
        "shopId": "s1"
    }]);

    let checkout = app
        .request(
            Method::POST,
            "/api/v1/checkout/sessions",
            Some(json!({ "cart": huge })),
            Some(&app.buyer_token()),
        )
        .await;
    assert_eq!(checkout.status(), 400);
    let body = response_json(checkout).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Cart total out of range"));

    let coupon = app
        .request(
            Method::PUT,
            "/api/v1/coupons/verify",
            Some(json!({ "couponCode": COUPON_CODE, "cart": huge })),
            Some(&app.buyer_token()),
        )
        .await;
    assert_eq!(coupon.status(), 400);
    assert_eq!(app.sessions.len().await, 0);
}

#[tokio::test]
async fn expired_or_unknown_session_is_acknowledged_without_orders() {
    let app = TestApp::new().await;

    let response = app
        .deliver_payment_succeeded(&Uuid::new_v4().to_string(), BUYER)
        .await;
    assert_eq!(response.status(), 200);

    let orders = order::Entity::find().count(&*app.state.db).await.unwrap();
    assert_eq!(orders, 0);
}

// ==================== Webhook Verification Tests ====================

#[tokio::test]
async fn bad_signature_is_rejected() {
    let app = TestApp::new().await;
    let session_id = app.open_session(json!({ "cart": two_shop_cart() })).await;
    let payload = common::payment_succeeded_payload(&session_id, BUYER);

    let response = app
        .deliver_webhook(&payload, Some("t=1700000000,v1=deadbeef"))
        .await;
    assert_eq!(response.status(), 400);
    let body = response_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Webhook Error"));

    let unsigned = app.deliver_webhook(&payload, None).await;
    assert_eq!(unsigned.status(), 400);

    // The session survives for a correctly signed retry
    assert_eq!(app.sessions.len().await, 1);
    let orders = order::Entity::find().count(&*app.state.db).await.unwrap();
    assert_eq!(orders, 0);
}

#[tokio::test]
async fn unrelated_events_are_acknowledged() {
    let app = TestApp::new().await;
    let payload = serde_json::to_vec(&json!({
        "id": "evt_other",
        "type": "charge.refunded",
        "data": {"object": {"id": "ch_1"}}
    }))
    .unwrap();
    let signature = marketplace_checkout::webhooks::WebhookVerifier::new(
        common::WEBHOOK_SECRET,
        300,
    )
    .sign(&payload, chrono::Utc::now().timestamp())
    .unwrap();

    let response = app.deliver_webhook(&payload, Some(&signature)).await;
    assert_eq!(response.status(), 200);
}

// ==================== Coupon Verification Tests ====================

#[tokio::test]
async fn coupon_verification_reports_clamped_discount() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::PUT,
            "/api/v1/coupons/verify",
            Some(json!({ "couponCode": COUPON_CODE, "cart": two_shop_cart() })),
            Some(&app.buyer_token()),
        )
        .await;

    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["valid"], true);
    assert_eq!(body["discountedProductId"], "p1");
    assert_eq!(decimal(&body["discountAmount"]), dec!(200));
}

#[tokio::test]
async fn coupon_without_matching_product_is_not_valid() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::PUT,
            "/api/v1/coupons/verify",
            Some(json!({
                "couponCode": COUPON_CODE,
                "cart": [common::cart_line("p2", "s2", 1, dec!(50))]
            })),
            Some(&app.buyer_token()),
        )
        .await;

    assert_eq!(response.status(), 200);
    let body = response_json(response).await;
    assert_eq!(body["valid"], false);
}
