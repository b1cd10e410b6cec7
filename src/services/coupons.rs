use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;

use crate::{
    cart::{self, CartLine},
    entities::{discount_code, product},
    errors::ServiceError,
    session_store::CouponSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    Percentage,
    Flat,
}

impl DiscountType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "percentage" => Some(Self::Percentage),
            "flat" => Some(Self::Flat),
            _ => None,
        }
    }
}

/// Discount for one cart line worth `line_price`.
///
/// Percentage discounts take `line_price * value / 100`; flat discounts take
/// `value`. The result is rounded to cents and clamped to `[0, line_price]`,
/// so a coupon can never push a line below zero.
pub fn compute_discount(discount_type: DiscountType, value: Decimal, line_price: Decimal) -> Decimal {
    let raw = match discount_type {
        // Past 100% the product can overflow; the clamp below caps it anyway
        DiscountType::Percentage => (value / Decimal::ONE_HUNDRED)
            .checked_mul(line_price)
            .unwrap_or(if value.is_sign_negative() { Decimal::ZERO } else { line_price }),
        DiscountType::Flat => value,
    };
    raw.round_dp(2).min(line_price).max(Decimal::ZERO)
}

/// Outcome of checking a coupon against a cart. An inapplicable coupon is a
/// normal result (`valid: false`), not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponVerification {
    pub valid: bool,
    /// Configured discount value (percent or flat amount)
    #[schema(value_type = f64)]
    pub discount: Decimal,
    #[schema(value_type = f64)]
    pub discount_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discounted_product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_type: Option<DiscountType>,
    pub message: String,
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Looks up `code` and prices it against the first cart line whose
    /// product accepts it.
    #[instrument(skip(self, cart), fields(cart_lines = cart.len()))]
    pub async fn verify(
        &self,
        code: &str,
        cart: &[CartLine],
    ) -> Result<CouponVerification, ServiceError> {
        if code.trim().is_empty() || cart.is_empty() {
            return Err(ServiceError::ValidationError(
                "Coupon code and cart are required".to_string(),
            ));
        }
        cart::validate(cart)?;

        let discount = discount_code::Entity::find()
            .filter(discount_code::Column::DiscountCode.eq(code))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Coupon code isn't valid".to_string()))?;

        let discount_type = DiscountType::parse(&discount.discount_type).ok_or_else(|| {
            ServiceError::InternalError(format!(
                "discount code {} has unknown type {}",
                discount.id, discount.discount_type
            ))
        })?;

        let product_ids: Vec<String> = cart.iter().map(|line| line.id.clone()).collect();
        let products = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&*self.db)
            .await?;

        let matching = cart.iter().find(|line| {
            products
                .iter()
                .any(|p| p.id == line.id && p.accepts_discount(&discount.id))
        });

        let Some(line) = matching else {
            debug!(code, "Coupon has no eligible line in cart");
            return Ok(CouponVerification {
                valid: false,
                discount: Decimal::ZERO,
                discount_amount: Decimal::ZERO,
                discounted_product_id: None,
                discount_type: None,
                message: "No matching product found in cart for this coupon".to_string(),
            });
        };

        let discount_amount =
            compute_discount(discount_type, discount.discount_value, line.line_total());

        Ok(CouponVerification {
            valid: true,
            discount: discount.discount_value,
            discount_amount,
            discounted_product_id: Some(line.id.clone()),
            discount_type: Some(discount_type),
            message: "Discount applied to 1 eligible product".to_string(),
        })
    }

    /// Validates a coupon for checkout and captures what the materializer
    /// needs to apply it later.
    pub async fn snapshot(
        &self,
        code: &str,
        cart: &[CartLine],
    ) -> Result<CouponSnapshot, ServiceError> {
        let verification = match self.verify(code, cart).await {
            Err(ServiceError::NotFound(message)) => {
                return Err(ServiceError::ValidationError(message))
            }
            other => other?,
        };

        match (
            verification.valid,
            verification.discount_type,
            verification.discounted_product_id,
        ) {
            (true, Some(discount_type), Some(line_id)) => Ok(CouponSnapshot {
                code: code.to_string(),
                discount_type,
                discount_value: verification.discount,
                discount_amount: verification.discount_amount,
                discounted_line_id: line_id,
            }),
            _ => Err(ServiceError::ValidationError(verification.message)),
        }
    }
}
