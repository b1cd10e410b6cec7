//! Per-user action logs and per-product counters, fed by storefront browsing
//! events and by order materialization.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;
use validator::Validate;

use crate::entities::{product_analytics, user_analytics};
use crate::errors::ServiceError;

/// Most recent entries kept in a user's action log.
pub const ACTION_LOG_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    ProductView,
    AddToCart,
    RemoveFromCart,
    AddToWishlist,
    RemoveFromWishlist,
    Purchase,
}

impl UserAction {
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "product_view" => Some(Self::ProductView),
            "add_to_cart" => Some(Self::AddToCart),
            "remove_from_cart" => Some(Self::RemoveFromCart),
            "add_to_wishlist" => Some(Self::AddToWishlist),
            "remove_from_wishlist" => Some(Self::RemoveFromWishlist),
            "purchase" => Some(Self::Purchase),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<String>,
    pub action: UserAction,
    pub timestamp: DateTime<Utc>,
}

/// Applies one action to a log:
/// views and purchases are always appended, adds only once per product,
/// removes drop the matching add. The log is trimmed to the newest
/// [`ACTION_LOG_CAP`] entries.
pub fn apply_action(mut log: Vec<ActionEntry>, entry: ActionEntry) -> Vec<ActionEntry> {
    let already_logged = |log: &[ActionEntry]| {
        log.iter()
            .any(|e| e.product_id == entry.product_id && e.action == entry.action)
    };

    match entry.action {
        UserAction::ProductView | UserAction::Purchase => log.push(entry),
        UserAction::AddToCart | UserAction::AddToWishlist => {
            if !already_logged(&log) {
                log.push(entry);
            }
        }
        UserAction::RemoveFromCart => log.retain(|e| {
            !(e.product_id == entry.product_id && e.action == UserAction::AddToCart)
        }),
        UserAction::RemoveFromWishlist => log.retain(|e| {
            !(e.product_id == entry.product_id && e.action == UserAction::AddToWishlist)
        }),
    }

    if log.len() > ACTION_LOG_CAP {
        let overflow = log.len() - ACTION_LOG_CAP;
        log.drain(..overflow);
    }
    log
}

fn decode_log(raw: &serde_json::Value) -> Vec<ActionEntry> {
    match serde_json::from_value(raw.clone()) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "Discarding unreadable action log");
            Vec::new()
        }
    }
}

/// Optional visitor details stored alongside the action log.
#[derive(Debug, Clone, Default)]
pub struct VisitContext {
    pub country: Option<String>,
    pub city: Option<String>,
    pub device: Option<String>,
}

/// Appends `entry` to the user's action log, creating the record on first use.
pub async fn record_user_action<C: ConnectionTrait>(
    db: &C,
    user_id: &str,
    entry: ActionEntry,
    visit: VisitContext,
) -> Result<(), DbErr> {
    let now = Utc::now();
    let existing = user_analytics::Entity::find_by_id(user_id.to_string())
        .one(db)
        .await?;

    match existing {
        Some(model) => {
            let log = apply_action(decode_log(&model.actions), entry);
            let mut active: user_analytics::ActiveModel = model.into();
            active.actions = Set(serde_json::to_value(&log).map_err(|e| DbErr::Custom(e.to_string()))?);
            active.last_visited = Set(now);
            if visit.country.is_some() {
                active.country = Set(visit.country);
            }
            if visit.city.is_some() {
                active.city = Set(visit.city);
            }
            if visit.device.is_some() {
                active.device = Set(visit.device);
            }
            active.update(db).await?;
        }
        None => {
            let log = apply_action(Vec::new(), entry);
            user_analytics::ActiveModel {
                user_id: Set(user_id.to_string()),
                last_visited: Set(now),
                actions: Set(serde_json::to_value(&log).map_err(|e| DbErr::Custom(e.to_string()))?),
                country: Set(visit.country),
                city: Set(visit.city),
                device: Set(visit.device),
            }
            .insert(db)
            .await?;
        }
    }

    Ok(())
}

/// Bumps the counter matching a browsing `action`. Counters never drop
/// below zero.
pub async fn record_product_action<C: ConnectionTrait>(
    db: &C,
    product_id: &str,
    shop_id: Option<&str>,
    action: UserAction,
) -> Result<(), DbErr> {
    let delta = match action {
        UserAction::RemoveFromCart | UserAction::RemoveFromWishlist => -1,
        _ => 1,
    };
    adjust_product_counter(db, product_id, shop_id, action, delta).await
}

/// Adds `quantity` units to the product's purchase counter.
pub async fn record_purchase<C: ConnectionTrait>(
    db: &C,
    product_id: &str,
    shop_id: &str,
    quantity: i32,
) -> Result<(), DbErr> {
    adjust_product_counter(db, product_id, Some(shop_id), UserAction::Purchase, quantity).await
}

async fn adjust_product_counter<C: ConnectionTrait>(
    db: &C,
    product_id: &str,
    shop_id: Option<&str>,
    action: UserAction,
    delta: i32,
) -> Result<(), DbErr> {
    use product_analytics::Column;

    let now = Utc::now();
    let exists = product_analytics::Entity::find_by_id(product_id.to_string())
        .one(db)
        .await?
        .is_some();

    if !exists {
        let initial = |kind: UserAction| if action == kind { delta.max(0) } else { 0 };
        product_analytics::ActiveModel {
            product_id: Set(product_id.to_string()),
            shop_id: Set(shop_id.map(str::to_string)),
            views: Set(initial(UserAction::ProductView)),
            cart_adds: Set(initial(UserAction::AddToCart) + initial(UserAction::RemoveFromCart)),
            wishlist_adds: Set(
                initial(UserAction::AddToWishlist) + initial(UserAction::RemoveFromWishlist),
            ),
            purchases: Set(initial(UserAction::Purchase)),
            last_viewed_at: Set(now),
        }
        .insert(db)
        .await?;
        return Ok(());
    }

    let column = match action {
        UserAction::ProductView => Column::Views,
        UserAction::AddToCart | UserAction::RemoveFromCart => Column::CartAdds,
        UserAction::AddToWishlist | UserAction::RemoveFromWishlist => Column::WishlistAdds,
        UserAction::Purchase => Column::Purchases,
    };

    let mut update = product_analytics::Entity::update_many()
        .col_expr(column, Expr::col(column).add(delta))
        .col_expr(Column::LastViewedAt, Expr::value(now))
        .filter(Column::ProductId.eq(product_id));
    if delta < 0 {
        update = update.filter(column.gte(-delta));
    }
    update.exec(db).await?;

    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackEventRequest {
    /// One of `product_view`, `add_to_cart`, `remove_from_cart`,
    /// `add_to_wishlist`, `remove_from_wishlist`
    #[validate(length(min = 1))]
    pub action: String,
    #[validate(length(min = 1))]
    pub product_id: String,
    pub shop_id: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub device: Option<String>,
}

#[derive(Clone)]
pub struct AnalyticsService {
    db: Arc<DatabaseConnection>,
}

impl AnalyticsService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Records a browsing action. Purchases are only recorded by order
    /// materialization and are rejected here.
    #[instrument(skip(self, request), fields(action = %request.action, product_id = %request.product_id))]
    pub async fn track(&self, user_id: &str, request: TrackEventRequest) -> Result<(), ServiceError> {
        request.validate()?;

        let action = match UserAction::parse(&request.action) {
            Some(UserAction::Purchase) | None => {
                return Err(ServiceError::ValidationError(format!(
                    "Unknown analytics action: {}",
                    request.action
                )))
            }
            Some(action) => action,
        };

        let entry = ActionEntry {
            product_id: request.product_id.clone(),
            shop_id: request.shop_id.clone(),
            action,
            timestamp: Utc::now(),
        };
        let visit = VisitContext {
            country: request.country,
            city: request.city,
            device: request.device,
        };

        record_user_action(&*self.db, user_id, entry, visit).await?;
        record_product_action(
            &*self.db,
            &request.product_id,
            request.shop_id.as_deref(),
            action,
        )
        .await?;

        debug!(user_id, "Analytics event recorded");
        Ok(())
    }
}
