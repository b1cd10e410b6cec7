// Checkout
pub mod coupons;
pub mod order_materializer;
pub mod payment_sessions;

// Orders and fulfilment
pub mod orders;

// Browsing and purchase analytics
pub mod analytics;
