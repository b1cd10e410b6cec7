use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Select};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::{AuthenticatedUser, Role},
    entities::{
        discount_code,
        order::{self, DeliveryStatus, OrderStatus},
        order_item, product, shop,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    pub id: Uuid,
    pub product_id: String,
    pub quantity: i32,
    #[schema(value_type = f64)]
    pub price: Decimal,
    #[schema(value_type = Object)]
    pub selected_options: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<ProductSummary>,
}

impl From<order_item::Model> for OrderItemView {
    fn from(item: order_item::Model) -> Self {
        Self {
            id: item.id,
            product_id: item.product_id,
            quantity: item.quantity,
            price: item.price,
            selected_options: item.selected_options,
            product: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: Uuid,
    pub user_id: String,
    pub shop_id: String,
    pub session_id: Uuid,
    #[schema(value_type = f64)]
    pub total: Decimal,
    pub status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub shipping_address_id: Option<String>,
    pub coupon_code: Option<String>,
    #[schema(value_type = f64)]
    pub discount_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub items: Vec<OrderItemView>,
}

impl OrderView {
    fn new(order: order::Model, items: Vec<order_item::Model>) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            shop_id: order.shop_id,
            session_id: order.session_id,
            total: order.total,
            status: order.status,
            delivery_status: order.delivery_status,
            shipping_address_id: order.shipping_address_id,
            coupon_code: order.coupon_code,
            discount_amount: order.discount_amount,
            created_at: order.created_at,
            updated_at: order.updated_at,
            items: items.into_iter().map(OrderItemView::from).collect(),
        }
    }
}

/// Coupon details shown alongside an order
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppliedCoupon {
    pub public_name: String,
    pub discount_code: String,
    pub discount_type: String,
    #[schema(value_type = f64)]
    pub discount_value: Decimal,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: OrderView,
    pub coupon: Option<AppliedCoupon>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderListResponse {
    pub success: bool,
    pub orders: Vec<OrderView>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderDetailsResponse {
    pub success: bool,
    pub order: OrderDetails,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeliveryStatusRequest {
    /// One of `Ordered`, `Packed`, `Shipped`, `Out for Delivery`, `Delivered`
    pub delivery_status: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UpdateDeliveryStatusResponse {
    pub success: bool,
    pub message: String,
    pub order: OrderView,
}

/// Order queries and fulfilment updates.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    async fn load_with_items(
        &self,
        query: Select<order::Entity>,
    ) -> Result<Vec<OrderView>, ServiceError> {
        let rows = query
            .order_by_desc(order::Column::CreatedAt)
            .find_with_related(order_item::Entity)
            .all(&*self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(order, items)| OrderView::new(order, items))
            .collect())
    }

    /// The buyer's orders, newest first.
    #[instrument(skip(self))]
    pub async fn list_user_orders(&self, user_id: &str) -> Result<Vec<OrderView>, ServiceError> {
        self.load_with_items(order::Entity::find().filter(order::Column::UserId.eq(user_id)))
            .await
    }

    /// Orders placed with the seller's shop, newest first.
    #[instrument(skip(self))]
    pub async fn list_shop_orders(&self, seller_id: &str) -> Result<Vec<OrderView>, ServiceError> {
        let shop = shop::Entity::find()
            .filter(shop::Column::SellerId.eq(seller_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Shop not found".to_string()))?;

        self.load_with_items(order::Entity::find().filter(order::Column::ShopId.eq(shop.id)))
            .await
    }

    pub async fn list_all_orders(&self) -> Result<Vec<OrderView>, ServiceError> {
        self.load_with_items(order::Entity::find()).await
    }

    async fn find_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))
    }

    async fn seller_owns_shop(&self, seller_id: &str, shop_id: &str) -> Result<bool, ServiceError> {
        let shop = shop::Entity::find_by_id(shop_id.to_string())
            .one(&*self.db)
            .await?;
        Ok(shop.map(|s| s.seller_id == seller_id).unwrap_or(false))
    }

    async fn can_manage(&self, caller: &AuthenticatedUser, order: &order::Model) -> Result<bool, ServiceError> {
        match caller.role {
            Role::Admin => Ok(true),
            Role::Seller => self.seller_owns_shop(&caller.user_id, &order.shop_id).await,
            Role::User => Ok(false),
        }
    }

    /// Order with items, product titles and coupon details. Visible to the
    /// buyer, the owning seller and admins.
    #[instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn get_order_details(
        &self,
        caller: &AuthenticatedUser,
        order_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let order = self.find_order(order_id).await?;
        if order.user_id != caller.user_id && !self.can_manage(caller, &order).await? {
            return Err(ServiceError::Forbidden(
                "You are not allowed to view this order".to_string(),
            ));
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;

        let product_ids: Vec<String> = items.iter().map(|i| i.product_id.clone()).collect();
        let titles: HashMap<String, String> = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p.title))
            .collect();

        let coupon = match &order.coupon_code {
            Some(code) => discount_code::Entity::find()
                .filter(discount_code::Column::DiscountCode.eq(code.as_str()))
                .one(&*self.db)
                .await?
                .map(|d| AppliedCoupon {
                    public_name: d.public_name,
                    discount_code: d.discount_code,
                    discount_type: d.discount_type,
                    discount_value: d.discount_value,
                }),
            None => None,
        };

        let mut view = OrderView::new(order, items);
        for item in &mut view.items {
            item.product = titles.get(&item.product_id).map(|title| ProductSummary {
                id: item.product_id.clone(),
                title: title.clone(),
            });
        }

        Ok(OrderDetails {
            order: view,
            coupon,
        })
    }

    /// Moves an order one step along
    /// `Ordered → Packed → Shipped → Out for Delivery → Delivered`.
    #[instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn update_delivery_status(
        &self,
        caller: &AuthenticatedUser,
        order_id: Uuid,
        requested: &str,
    ) -> Result<OrderView, ServiceError> {
        let target = DeliveryStatus::parse(requested.trim())
            .ok_or_else(|| ServiceError::ValidationError("Invalid delivery status".to_string()))?;

        let order = self.find_order(order_id).await?;
        if !self.can_manage(caller, &order).await? {
            return Err(ServiceError::Forbidden(
                "Only the shop's seller can update this order".to_string(),
            ));
        }

        let current = order.delivery_status;
        if !current.can_transition_to(target) {
            return Err(ServiceError::ValidationError(format!(
                "Cannot move delivery status from {} to {}",
                current.as_str(),
                target.as_str()
            )));
        }

        // Applies only while the stored status is still `current`
        let result = order::Entity::update_many()
            .col_expr(order::Column::DeliveryStatus, Expr::value(target))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::DeliveryStatus.eq(current))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "Order was updated by another request".to_string(),
            ));
        }

        info!(%order_id, from = current.as_str(), to = target.as_str(), "Delivery status updated");
        self.event_sender
            .send_or_log(Event::DeliveryStatusChanged {
                order_id,
                old_status: current,
                new_status: target,
            })
            .await;

        let updated = self.find_order(order_id).await?;
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(OrderView::new(updated, items))
    }
}
