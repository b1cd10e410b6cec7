use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::{
    auth::{AuthenticatedUser, Role},
    errors::ServiceError,
    services::orders::{
        OrderDetailsResponse, OrderListResponse, UpdateDeliveryStatusRequest,
        UpdateDeliveryStatusResponse,
    },
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/v1/orders/mine",
    summary = "List my orders",
    responses(
        (status = 200, description = "Caller's orders, newest first", body = OrderListResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_my_orders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<OrderListResponse>, ServiceError> {
    let orders = state.services.orders.list_user_orders(&user.user_id).await?;
    Ok(Json(OrderListResponse {
        success: true,
        orders,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/shop",
    summary = "List shop orders",
    responses(
        (status = 200, description = "Orders for the seller's shop, newest first", body = OrderListResponse),
        (status = 403, description = "Caller is not a seller", body = crate::errors::ErrorResponse),
        (status = 404, description = "Shop not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_shop_orders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<OrderListResponse>, ServiceError> {
    user.require_role(Role::Seller)?;
    let orders = state.services.orders.list_shop_orders(&user.user_id).await?;
    Ok(Json(OrderListResponse {
        success: true,
        orders,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List all orders",
    responses(
        (status = 200, description = "Every order, newest first", body = OrderListResponse),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_all_orders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<OrderListResponse>, ServiceError> {
    user.require_role(Role::Admin)?;
    let orders = state.services.orders.list_all_orders().await?;
    Ok(Json(OrderListResponse {
        success: true,
        orders,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{order_id}",
    summary = "Get order details",
    params(("order_id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with items and coupon", body = OrderDetailsResponse),
        (status = 403, description = "Not the buyer, the shop's seller or an admin", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order_details(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<Json<OrderDetailsResponse>, ServiceError> {
    let order = state.services.orders.get_order_details(&user, order_id).await?;
    Ok(Json(OrderDetailsResponse {
        success: true,
        order,
    }))
}

#[utoipa::path(
    put,
    path = "/api/v1/orders/{order_id}/delivery-status",
    summary = "Advance delivery status",
    description = "Moves the order one step along Ordered → Packed → Shipped → Out for Delivery → Delivered",
    params(("order_id" = Uuid, Path, description = "Order id")),
    request_body = UpdateDeliveryStatusRequest,
    responses(
        (status = 200, description = "Delivery status updated successfully", body = UpdateDeliveryStatusResponse),
        (status = 400, description = "Invalid delivery status or transition", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the shop's seller", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Concurrent update", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn update_delivery_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(request): Json<UpdateDeliveryStatusRequest>,
) -> Result<Json<UpdateDeliveryStatusResponse>, ServiceError> {
    let order = state
        .services
        .orders
        .update_delivery_status(&user, order_id, &request.delivery_status)
        .await?;
    Ok(Json(UpdateDeliveryStatusResponse {
        success: true,
        message: "Delivery status updated successfully".to_string(),
        order,
    }))
}
