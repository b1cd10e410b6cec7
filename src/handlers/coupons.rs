use axum::{extract::State, Json};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::{
    auth::AuthenticatedUser,
    cart::CartLine,
    errors::ServiceError,
    services::coupons::CouponVerification,
    AppState,
};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCouponRequest {
    pub coupon_code: String,
    pub cart: Vec<CartLine>,
}

#[utoipa::path(
    put,
    path = "/api/v1/coupons/verify",
    summary = "Verify coupon",
    description = "Prices a coupon against the cart. A coupon that fits no cart line is reported with valid=false.",
    request_body = VerifyCouponRequest,
    responses(
        (status = 200, description = "Verification result", body = CouponVerification),
        (status = 400, description = "Coupon code and cart are required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Coupon code isn't valid", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn verify_coupon(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Json(request): Json<VerifyCouponRequest>,
) -> Result<Json<CouponVerification>, ServiceError> {
    let verification = state
        .services
        .coupons
        .verify(request.coupon_code.trim(), &request.cart)
        .await?;
    Ok(Json(verification))
}
