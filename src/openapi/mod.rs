use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Marketplace Checkout API",
        version = "1.0.0",
        description = r#"
# Marketplace Checkout API

Checkout sessions, payment intents and webhook-driven order creation for a
multi-shop marketplace.

## Flow

1. The storefront opens a checkout session for the buyer's cart.
2. It requests a payment intent for the session against a shop's payout account.
3. The payment processor confirms the charge through the signed webhook.
4. One order per shop is created from the session and the session is closed.

## Authentication

Every endpoint except the webhook and health checks requires a bearer token:

```
Authorization: Bearer <your-jwt-token>
```

The webhook is authenticated by its `stripe-signature` header instead.

## Error Handling

```json
{
  "error": "Bad Request",
  "message": "Session id is missing",
  "request_id": "4f0c...",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Checkout", description = "Checkout sessions and coupons"),
        (name = "Payments", description = "Payment intents and processor webhooks"),
        (name = "Orders", description = "Order history and fulfilment"),
        (name = "Analytics", description = "Browsing and purchase tracking"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        // Checkout
        crate::handlers::checkout::create_payment_session,
        crate::handlers::checkout::get_payment_session,
        crate::handlers::coupons::verify_coupon,

        // Payments
        crate::handlers::payments::create_payment_intent,
        crate::handlers::payment_webhooks::payment_webhook,

        // Orders
        crate::handlers::orders::list_my_orders,
        crate::handlers::orders::list_shop_orders,
        crate::handlers::orders::list_all_orders,
        crate::handlers::orders::get_order_details,
        crate::handlers::orders::update_delivery_status,

        // Analytics
        crate::handlers::analytics::track_event,

        // Health
        crate::handlers::health::liveness_check,
        crate::handlers::health::readiness_check,
    ),
    components(
        schemas(
            // Checkout types
            crate::cart::CartLine,
            crate::services::payment_sessions::CouponInput,
            crate::services::payment_sessions::CreateSessionRequest,
            crate::services::payment_sessions::CreateSessionResponse,
            crate::services::payment_sessions::SessionEnvelope,
            crate::session_store::PaymentSession,
            crate::session_store::CouponSnapshot,
            crate::handlers::coupons::VerifyCouponRequest,
            crate::services::coupons::CouponVerification,
            crate::services::coupons::DiscountType,

            // Payments types
            crate::services::payment_sessions::CreatePaymentIntentRequest,
            crate::services::payment_sessions::PaymentIntentResponse,
            crate::handlers::payment_webhooks::WebhookAck,

            // Order types
            crate::entities::order::OrderStatus,
            crate::entities::order::DeliveryStatus,
            crate::services::orders::ProductSummary,
            crate::services::orders::OrderItemView,
            crate::services::orders::OrderView,
            crate::services::orders::AppliedCoupon,
            crate::services::orders::OrderDetails,
            crate::services::orders::OrderListResponse,
            crate::services::orders::OrderDetailsResponse,
            crate::services::orders::UpdateDeliveryStatusRequest,
            crate::services::orders::UpdateDeliveryStatusResponse,

            // Analytics types
            crate::services::analytics::UserAction,
            crate::services::analytics::TrackEventRequest,

            // Error types
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
