//! Cart lines as submitted by the storefront, plus the normalizer used to
//! detect equivalent in-flight payment sessions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::errors::ServiceError;

/// One line of a buyer's cart. Unknown client fields are kept so the stored
/// session can be shown back to the storefront unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CartLine {
    /// Product id
    pub id: String,
    pub quantity: i32,
    #[schema(value_type = f64)]
    pub sale_price: Decimal,
    #[serde(rename = "shopId")]
    pub shop_id: String,
    #[serde(rename = "selectedOptions", default = "empty_options")]
    #[schema(value_type = Object)]
    pub selected_options: Value,
    #[serde(flatten)]
    #[schema(ignore)]
    pub extra: Map<String, Value>,
}

fn empty_options() -> Value {
    Value::Object(Map::new())
}

impl CartLine {
    /// `quantity * sale_price`, or `None` when it does not fit a `Decimal`.
    pub fn checked_line_total(&self) -> Option<Decimal> {
        self.sale_price.checked_mul(Decimal::from(self.quantity))
    }

    /// `quantity * sale_price` for a line that passed [`validate`].
    pub fn line_total(&self) -> Decimal {
        self.sale_price.saturating_mul(Decimal::from(self.quantity))
    }

    fn options_or_empty(&self) -> Value {
        match &self.selected_options {
            Value::Null => empty_options(),
            other => other.clone(),
        }
    }
}

#[derive(Serialize)]
struct CanonicalLine<'a> {
    id: &'a str,
    quantity: i32,
    sale_price: Decimal,
    #[serde(rename = "shopId")]
    shop_id: &'a str,
    #[serde(rename = "selectedOptions")]
    selected_options: Value,
}

/// Order-independent fingerprint of a cart. Two carts that differ only in line
/// order or in extra client fields produce the same fingerprint.
pub fn fingerprint(lines: &[CartLine]) -> Result<String, ServiceError> {
    let mut canonical: Vec<CanonicalLine<'_>> = lines
        .iter()
        .map(|line| CanonicalLine {
            id: &line.id,
            quantity: line.quantity,
            sale_price: line.sale_price.normalize(),
            shop_id: &line.shop_id,
            selected_options: line.options_or_empty(),
        })
        .collect();
    canonical.sort_by(|a, b| a.id.cmp(b.id));

    Ok(serde_json::to_string(&canonical)?)
}

/// Rejects empty or malformed carts, and carts whose total does not fit a
/// `Decimal`.
pub fn validate(lines: &[CartLine]) -> Result<(), ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::ValidationError(
            "Cart is empty or invalid".to_string(),
        ));
    }

    let mut total = Decimal::ZERO;
    for line in lines {
        if line.id.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Cart line is missing a product id".to_string(),
            ));
        }
        if line.shop_id.trim().is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "Cart line {} is missing a shop id",
                line.id
            )));
        }
        if line.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Cart line {} must have a positive quantity",
                line.id
            )));
        }
        if line.sale_price.is_sign_negative() {
            return Err(ServiceError::ValidationError(format!(
                "Cart line {} has a negative price",
                line.id
            )));
        }
        total = line
            .checked_line_total()
            .and_then(|line_total| total.checked_add(line_total))
            .ok_or_else(|| ServiceError::ValidationError("Cart total out of range".to_string()))?;
    }

    Ok(())
}

/// Sum of `quantity * sale_price` over every line of a validated cart.
pub fn total_amount(lines: &[CartLine]) -> Decimal {
    lines
        .iter()
        .fold(Decimal::ZERO, |total, line| total.saturating_add(line.line_total()))
}

/// Groups lines by shop, keeping shops in first-seen order.
pub fn group_by_shop(lines: &[CartLine]) -> Vec<(String, Vec<CartLine>)> {
    let mut groups: Vec<(String, Vec<CartLine>)> = Vec::new();
    for line in lines {
        match groups.iter_mut().find(|(shop_id, _)| *shop_id == line.shop_id) {
            Some((_, group)) => group.push(line.clone()),
            None => groups.push((line.shop_id.clone(), vec![line.clone()])),
        }
    }
    groups
}

/// Distinct shop ids in first-seen order.
pub fn shop_ids(lines: &[CartLine]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for line in lines {
        if !ids.contains(&line.shop_id) {
            ids.push(line.shop_id.clone());
        }
    }
    ids
}
