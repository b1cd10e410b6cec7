//! Turns a confirmed payment session into one order per shop.
//!
//! All shop groups of a session commit in a single transaction: either every
//! order exists with its stock and analytics applied, or none does and the
//! webhook is redelivered. Concurrent deliveries are serialized by a claim
//! in the session store, and a session that already has orders is treated
//! as consumed.

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, Set, TransactionTrait,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    cart::{self, CartLine},
    entities::{
        order::{self, DeliveryStatus, OrderStatus},
        order_item, product, shop, user,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::{EmailMessage, Mailer, NewNotification, NotificationService},
    services::analytics::{self, ActionEntry, UserAction, VisitContext},
    services::coupons::compute_discount,
    session_store::{PaymentSession, SessionStore},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializationOutcome {
    Materialized { order_ids: Vec<Uuid> },
    /// Session expired or already consumed
    SessionMissing,
    /// Another delivery is materializing this session right now
    AlreadyClaimed,
    /// Orders for this session already exist
    AlreadyMaterialized,
}

#[derive(Debug, Clone)]
pub struct MaterializerSettings {
    pub claim_ttl: Duration,
    pub admin_receiver_id: String,
    pub storefront_base_url: String,
}

/// Order created for one shop group.
#[derive(Debug, Clone)]
struct ShopOrder {
    order_id: Uuid,
    shop_id: String,
    first_product_id: String,
    discount: Decimal,
}

#[derive(Clone)]
pub struct OrderMaterializer {
    db: Arc<DatabaseConnection>,
    store: Arc<dyn SessionStore>,
    mailer: Arc<dyn Mailer>,
    notifications: NotificationService,
    event_sender: EventSender,
    settings: MaterializerSettings,
}

impl OrderMaterializer {
    pub fn new(
        db: Arc<DatabaseConnection>,
        store: Arc<dyn SessionStore>,
        mailer: Arc<dyn Mailer>,
        event_sender: EventSender,
        settings: MaterializerSettings,
    ) -> Self {
        Self {
            db,
            store,
            mailer,
            notifications: NotificationService::new(),
            event_sender,
            settings,
        }
    }

    /// Materializes `session_id` for a verified payment. Redelivered or
    /// concurrent events for the same session are acknowledged without
    /// creating orders twice.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn materialize(
        &self,
        session_id: Uuid,
        buyer_id: &str,
    ) -> Result<MaterializationOutcome, ServiceError> {
        let Some(session) = self.store.load(session_id).await? else {
            info!("Payment session missing; nothing to materialize");
            return Ok(MaterializationOutcome::SessionMissing);
        };

        if session.user_id != buyer_id {
            warn!(
                session_user = %session.user_id,
                event_user = %buyer_id,
                "Payment metadata buyer differs from session owner; using session owner"
            );
        }

        if !self
            .store
            .try_claim(session_id, self.settings.claim_ttl)
            .await?
        {
            info!("Session is being materialized by another delivery");
            return Ok(MaterializationOutcome::AlreadyClaimed);
        }

        let persisted = match self.persist(&session).await {
            Ok(persisted) => persisted,
            Err(e) => {
                error!(error = %e, "Materialization rolled back");
                self.release_claim(session_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.store.remove(&session).await {
            error!(error = %e, "Failed to delete materialized session");
        }
        self.release_claim(session_id).await;

        let Some(orders) = persisted else {
            info!("Orders already exist for session");
            return Ok(MaterializationOutcome::AlreadyMaterialized);
        };

        counter!("checkout.orders_materialized", orders.len() as u64);
        for created in &orders {
            self.event_sender
                .send_or_log(Event::OrderCreated {
                    order_id: created.order_id,
                    session_id,
                    shop_id: created.shop_id.clone(),
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::SessionMaterialized {
                session_id,
                order_count: orders.len(),
                at: Utc::now(),
            })
            .await;

        self.notify(&session, &orders).await;

        info!(order_count = orders.len(), "Payment session materialized");
        Ok(MaterializationOutcome::Materialized {
            order_ids: orders.iter().map(|o| o.order_id).collect(),
        })
    }

    async fn release_claim(&self, session_id: Uuid) {
        if let Err(e) = self.store.release_claim(session_id).await {
            warn!(error = %e, %session_id, "Failed to release materialization claim");
        }
    }

    /// Writes every shop group in one transaction. `None` when the session
    /// already has orders.
    async fn persist(&self, session: &PaymentSession) -> Result<Option<Vec<ShopOrder>>, ServiceError> {
        let txn = self.db.begin().await?;

        let existing = order::Entity::find()
            .filter(order::Column::SessionId.eq(session.session_id))
            .count(&txn)
            .await?;
        if existing > 0 {
            txn.rollback().await?;
            return Ok(None);
        }

        let mut orders = Vec::new();
        for (shop_id, lines) in cart::group_by_shop(&session.cart) {
            let created = self
                .persist_shop_group(&txn, session, &shop_id, &lines)
                .await
                .map_err(|e| {
                    error!(error = %e, shop_id = %shop_id, "Shop group failed");
                    e
                })?;
            orders.push(created);
        }

        txn.commit().await?;
        Ok(Some(orders))
    }

    async fn persist_shop_group(
        &self,
        txn: &DatabaseTransaction,
        session: &PaymentSession,
        shop_id: &str,
        lines: &[CartLine],
    ) -> Result<ShopOrder, ServiceError> {
        let now = Utc::now();
        let subtotal = cart::total_amount(lines);

        let applied_coupon = session.coupon.as_ref().and_then(|coupon| {
            lines
                .iter()
                .find(|line| line.id == coupon.discounted_line_id)
                .map(|line| {
                    let discount =
                        compute_discount(coupon.discount_type, coupon.discount_value, line.line_total());
                    (coupon.code.clone(), discount)
                })
        });
        let discount = applied_coupon
            .as_ref()
            .map(|(_, amount)| *amount)
            .unwrap_or(Decimal::ZERO);

        let order_id = Uuid::new_v4();
        order::ActiveModel {
            id: Set(order_id),
            user_id: Set(session.user_id.clone()),
            shop_id: Set(shop_id.to_string()),
            session_id: Set(session.session_id),
            total: Set(subtotal - discount),
            status: Set(OrderStatus::Paid),
            delivery_status: Set(DeliveryStatus::Ordered),
            shipping_address_id: Set(session.shipping_address_id.clone()),
            coupon_code: Set(applied_coupon.map(|(code, _)| code)),
            discount_amount: Set(discount),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(txn)
        .await?;

        for line in lines {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.id.clone()),
                quantity: Set(line.quantity),
                price: Set(line.sale_price),
                selected_options: Set(line.selected_options.clone()),
                created_at: Set(now),
            }
            .insert(txn)
            .await?;

            let updated = product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(line.quantity),
                )
                .col_expr(
                    product::Column::TotalSales,
                    Expr::col(product::Column::TotalSales).add(line.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(now))
                .filter(product::Column::Id.eq(line.id.as_str()))
                .exec(txn)
                .await?;
            if updated.rows_affected == 0 {
                warn!(product_id = %line.id, shop_id, "Ordered product no longer exists; stock untouched");
            }

            analytics::record_purchase(txn, &line.id, shop_id, line.quantity).await?;
            analytics::record_user_action(
                txn,
                &session.user_id,
                ActionEntry {
                    product_id: line.id.clone(),
                    shop_id: Some(shop_id.to_string()),
                    action: UserAction::Purchase,
                    timestamp: now,
                },
                VisitContext::default(),
            )
            .await?;
        }

        Ok(ShopOrder {
            order_id,
            shop_id: shop_id.to_string(),
            first_product_id: lines.first().map(|l| l.id.clone()).unwrap_or_default(),
            discount,
        })
    }

    /// Buyer e-mail plus seller and admin notifications. Failures are logged
    /// and never undo the committed orders.
    async fn notify(&self, session: &PaymentSession, orders: &[ShopOrder]) {
        let db = &*self.db;
        let session_id = session.session_id;
        let order_link = format!("{}/order/{}", self.settings.storefront_base_url, session_id);

        let buyer = match user::Entity::find_by_id(session.user_id.clone()).one(db).await {
            Ok(buyer) => buyer,
            Err(e) => {
                warn!(error = %e, "Could not load buyer for notifications");
                None
            }
        };
        let buyer_name = buyer
            .as_ref()
            .map(|b| b.name.clone())
            .unwrap_or_else(|| session.user_id.clone());

        match buyer.as_ref().and_then(|b| b.email.clone()) {
            Some(email) => {
                let total_discount: Decimal = orders.iter().map(|o| o.discount).sum();
                let message = EmailMessage {
                    to: email,
                    subject: "Your Eshop Order Confirmation".to_string(),
                    template: "order-confirmation".to_string(),
                    context: json!({
                        "name": buyer_name,
                        "cart": session.cart,
                        "totalAmount": session.total_amount - total_discount,
                        "trackingUrl": format!("{}/track/{}", self.settings.storefront_base_url, session_id),
                    }),
                };
                if let Err(e) = self.mailer.send(message).await {
                    warn!(error = %e, "Order confirmation e-mail failed");
                }
            }
            None => warn!(user_id = %session.user_id, "No e-mail for buyer; skipping confirmation"),
        }

        for created in orders {
            let seller_id = match shop::Entity::find_by_id(created.shop_id.clone()).one(db).await {
                Ok(Some(shop)) => shop.seller_id,
                Ok(None) => {
                    warn!(shop_id = %created.shop_id, "Shop not found; seller not notified");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, shop_id = %created.shop_id, "Could not load shop");
                    continue;
                }
            };

            let title = product::Entity::find_by_id(created.first_product_id.clone())
                .one(db)
                .await
                .ok()
                .flatten()
                .map(|p| p.title)
                .unwrap_or_else(|| "new item".to_string());

            let result = self
                .notifications
                .create(
                    db,
                    NewNotification {
                        title: "New Order Received".to_string(),
                        message: format!("You have a new order for {}", title),
                        creator_id: session.user_id.clone(),
                        receiver_id: seller_id,
                        redirect_link: Some(order_link.clone()),
                    },
                )
                .await;
            if let Err(e) = result {
                warn!(error = %e, shop_id = %created.shop_id, "Seller notification failed");
            }
        }

        let result = self
            .notifications
            .create(
                db,
                NewNotification {
                    title: "Platform Order Alert".to_string(),
                    message: format!("A new order was placed by {}.", buyer_name),
                    creator_id: session.user_id.clone(),
                    receiver_id: self.settings.admin_receiver_id.clone(),
                    redirect_link: Some(order_link),
                },
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Admin notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::entities::{notification, seller};
    use crate::notifications::{LogMailer, NotificationError};
    use crate::session_store::{CouponSnapshot, InMemorySessionStore};
    use crate::services::coupons::DiscountType;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use sea_orm::{ConnectionTrait, Database};
    use serde_json::Map;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    struct FailingMailer;

    #[async_trait]
    impl Mailer for FailingMailer {
        async fn send(&self, _message: EmailMessage) -> Result<(), NotificationError> {
            Err(NotificationError::Delivery("smtp down".into()))
        }
    }

    async fn seed(db: &DatabaseConnection) {
        for (seller_id, shop_id, product_id, title) in
            [("seller-1", "s1", "p1", "Mug"), ("seller-2", "s2", "p2", "Lamp")]
        {
            seller::ActiveModel {
                id: Set(seller_id.into()),
                name: Set(seller_id.into()),
                email: Set(format!("{}@example.com", seller_id)),
                stripe_id: Set(Some(format!("acct_{}", shop_id))),
                created_at: Set(Utc::now()),
            }
            .insert(db)
            .await
            .unwrap();
            shop::ActiveModel {
                id: Set(shop_id.into()),
                seller_id: Set(seller_id.into()),
                name: Set(shop_id.into()),
                created_at: Set(Utc::now()),
            }
            .insert(db)
            .await
            .unwrap();
            product::ActiveModel {
                id: Set(product_id.into()),
                shop_id: Set(shop_id.into()),
                title: Set(title.into()),
                sale_price: Set(dec!(100)),
                stock: Set(10),
                total_sales: Set(0),
                discount_codes: Set(json!([])),
                created_at: Set(Utc::now()),
                updated_at: Set(None),
            }
            .insert(db)
            .await
            .unwrap();
        }
        user::ActiveModel {
            id: Set("u1".into()),
            name: Set("Grace".into()),
            email: Set(Some("grace@example.com".into())),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap();
    }

    fn line(id: &str, shop: &str, quantity: i32, price: Decimal) -> CartLine {
        CartLine {
            id: id.into(),
            quantity,
            sale_price: price,
            shop_id: shop.into(),
            selected_options: json!({}),
            extra: Map::new(),
        }
    }

    fn session(coupon: Option<CouponSnapshot>) -> PaymentSession {
        PaymentSession {
            session_id: Uuid::new_v4(),
            user_id: "u1".into(),
            cart: vec![line("p1", "s1", 2, dec!(100)), line("p2", "s2", 1, dec!(50))],
            seller_payout_targets: BTreeMap::from([
                ("s1".to_string(), "acct_s1".to_string()),
                ("s2".to_string(), "acct_s2".to_string()),
            ]),
            total_amount: dec!(250),
            shipping_address_id: Some("addr-1".into()),
            coupon,
            created_at: Utc::now(),
        }
    }

    async fn setup(
        mailer: Arc<dyn Mailer>,
    ) -> (OrderMaterializer, Arc<DatabaseConnection>, Arc<InMemorySessionStore>) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        seed(&db).await;
        let db = Arc::new(db);
        let store = Arc::new(InMemorySessionStore::new());
        let (tx, _rx) = mpsc::channel(64);
        let materializer = OrderMaterializer::new(
            db.clone(),
            store.clone(),
            mailer,
            EventSender::new(tx),
            MaterializerSettings {
                claim_ttl: Duration::from_secs(120),
                admin_receiver_id: "admin".into(),
                storefront_base_url: "https://shoplet.com".into(),
            },
        );
        (materializer, db, store)
    }

    #[tokio::test]
    async fn one_order_per_shop_with_stock_applied() {
        let (materializer, db, store) = setup(Arc::new(LogMailer)).await;
        let session = session(None);
        store.save(&session, Duration::from_secs(600)).await.unwrap();

        let outcome = materializer
            .materialize(session.session_id, "u1")
            .await
            .unwrap();
        let MaterializationOutcome::Materialized { order_ids } = outcome else {
            panic!("expected orders, got {outcome:?}");
        };
        assert_eq!(order_ids.len(), 2);

        let orders = order::Entity::find().all(&*db).await.unwrap();
        let s1 = orders.iter().find(|o| o.shop_id == "s1").unwrap();
        let s2 = orders.iter().find(|o| o.shop_id == "s2").unwrap();
        assert_eq!(s1.total, dec!(200));
        assert_eq!(s2.total, dec!(50));
        assert_eq!(s1.delivery_status, DeliveryStatus::Ordered);
        assert_eq!(s1.status, OrderStatus::Paid);

        let p1 = product::Entity::find_by_id("p1".to_string()).one(&*db).await.unwrap().unwrap();
        let p2 = product::Entity::find_by_id("p2".to_string()).one(&*db).await.unwrap().unwrap();
        assert_eq!(p1.stock, 8);
        assert_eq!(p1.total_sales, 2);
        assert_eq!(p2.stock, 9);

        assert!(store.load(session.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redelivery_is_a_no_op() {
        let (materializer, db, store) = setup(Arc::new(LogMailer)).await;
        let session = session(None);
        store.save(&session, Duration::from_secs(600)).await.unwrap();

        materializer.materialize(session.session_id, "u1").await.unwrap();
        let second = materializer.materialize(session.session_id, "u1").await.unwrap();
        assert_eq!(second, MaterializationOutcome::SessionMissing);

        assert_eq!(order::Entity::find().count(&*db).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failing_shop_group_rolls_back_every_order_and_keeps_session() {
        let (materializer, db, store) = setup(Arc::new(LogMailer)).await;
        let session = session(None);
        store.save(&session, Duration::from_secs(600)).await.unwrap();

        // The second shop group fails after the first one has been written
        db.execute_unprepared(
            "CREATE TRIGGER reject_s2_orders BEFORE INSERT ON orders \
             WHEN NEW.shop_id = 's2' BEGIN SELECT RAISE(ABORT, 'shop s2 unavailable'); END;",
        )
        .await
        .unwrap();

        let result = materializer.materialize(session.session_id, "u1").await;
        assert_matches!(result, Err(ServiceError::DatabaseError(_)));

        assert_eq!(order::Entity::find().count(&*db).await.unwrap(), 0);
        assert_eq!(order_item::Entity::find().count(&*db).await.unwrap(), 0);
        let p1 = product::Entity::find_by_id("p1".to_string()).one(&*db).await.unwrap().unwrap();
        assert_eq!((p1.stock, p1.total_sales), (10, 0));
        assert!(crate::entities::product_analytics::Entity::find_by_id("p1".to_string())
            .one(&*db)
            .await
            .unwrap()
            .is_none());
        assert!(store.load(session.session_id).await.unwrap().is_some());

        // Claim was released, so the redelivered event completes the session
        db.execute_unprepared("DROP TRIGGER reject_s2_orders;").await.unwrap();
        let retry = materializer.materialize(session.session_id, "u1").await.unwrap();
        assert_matches!(retry, MaterializationOutcome::Materialized { ref order_ids } if order_ids.len() == 2);
        let p1 = product::Entity::find_by_id("p1".to_string()).one(&*db).await.unwrap().unwrap();
        assert_eq!(p1.stock, 8);
    }

    #[tokio::test]
    async fn session_with_existing_orders_is_consumed_without_duplicates() {
        let (materializer, db, store) = setup(Arc::new(LogMailer)).await;
        let session = session(None);
        store.save(&session, Duration::from_secs(600)).await.unwrap();
        materializer.materialize(session.session_id, "u1").await.unwrap();

        // Session record resurfaces, e.g. a delete that never reached the store
        store.save(&session, Duration::from_secs(600)).await.unwrap();
        let outcome = materializer.materialize(session.session_id, "u1").await.unwrap();
        assert_eq!(outcome, MaterializationOutcome::AlreadyMaterialized);
        assert_eq!(order::Entity::find().count(&*db).await.unwrap(), 2);
        assert!(store.load(session.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_session_is_left_to_the_other_delivery() {
        let (materializer, db, store) = setup(Arc::new(LogMailer)).await;
        let session = session(None);
        store.save(&session, Duration::from_secs(600)).await.unwrap();
        assert!(store
            .try_claim(session.session_id, Duration::from_secs(60))
            .await
            .unwrap());

        let outcome = materializer.materialize(session.session_id, "u1").await.unwrap();
        assert_eq!(outcome, MaterializationOutcome::AlreadyClaimed);
        assert_eq!(order::Entity::find().count(&*db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn coupon_is_recorded_only_on_the_discounted_shop_order() {
        let (materializer, db, store) = setup(Arc::new(LogMailer)).await;
        let session = session(Some(CouponSnapshot {
            code: "HALF".into(),
            discount_type: DiscountType::Percentage,
            discount_value: dec!(150),
            discount_amount: dec!(200),
            discounted_line_id: "p1".into(),
        }));
        store.save(&session, Duration::from_secs(600)).await.unwrap();

        materializer.materialize(session.session_id, "u1").await.unwrap();

        let orders = order::Entity::find().all(&*db).await.unwrap();
        let s1 = orders.iter().find(|o| o.shop_id == "s1").unwrap();
        let s2 = orders.iter().find(|o| o.shop_id == "s2").unwrap();
        // 150% of a 200 line clamps to the line price
        assert_eq!(s1.total, Decimal::ZERO);
        assert_eq!(s1.discount_amount, dec!(200));
        assert_eq!(s1.coupon_code.as_deref(), Some("HALF"));
        assert_eq!(s2.total, dec!(50));
        assert_eq!(s2.discount_amount, Decimal::ZERO);
        assert_eq!(s2.coupon_code, None);
    }

    #[tokio::test]
    async fn notifications_go_to_each_seller_and_admin_once() {
        let (materializer, db, store) = setup(Arc::new(FailingMailer)).await;
        let session = session(None);
        store.save(&session, Duration::from_secs(600)).await.unwrap();

        // A failing mailer never blocks the orders
        let outcome = materializer.materialize(session.session_id, "u1").await.unwrap();
        assert_matches!(outcome, MaterializationOutcome::Materialized { .. });

        let notes = notification::Entity::find().all(&*db).await.unwrap();
        assert_eq!(notes.len(), 3);
        let receivers: Vec<&str> = notes.iter().map(|n| n.receiver_id.as_str()).collect();
        assert!(receivers.contains(&"seller-1"));
        assert!(receivers.contains(&"seller-2"));
        assert_eq!(receivers.iter().filter(|r| **r == "admin").count(), 1);

        let seller_note = notes.iter().find(|n| n.receiver_id == "seller-1").unwrap();
        assert_eq!(seller_note.message, "You have a new order for Mug");
        let admin_note = notes.iter().find(|n| n.receiver_id == "admin").unwrap();
        assert_eq!(admin_note.message, "A new order was placed by Grace.");
    }

    #[tokio::test]
    async fn purchases_feed_analytics() {
        let (materializer, db, store) = setup(Arc::new(LogMailer)).await;
        let session = session(None);
        store.save(&session, Duration::from_secs(600)).await.unwrap();
        materializer.materialize(session.session_id, "u1").await.unwrap();

        let stats = crate::entities::product_analytics::Entity::find_by_id("p1".to_string())
            .one(&*db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.purchases, 2);

        let user_stats = crate::entities::user_analytics::Entity::find_by_id("u1".to_string())
            .one(&*db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user_stats.actions.as_array().map(Vec::len), Some(2));
    }
}
