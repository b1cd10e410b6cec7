use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::DeliveryStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the loop has stopped.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Domain event dropped");
        }
    }
}

/// Domain events emitted by the checkout pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    PaymentSessionCreated {
        session_id: Uuid,
        user_id: String,
    },
    PaymentSessionReused {
        session_id: Uuid,
        user_id: String,
    },
    /// A buyer's previous pending session was discarded for a different cart
    PaymentSessionSuperseded {
        session_id: Uuid,
        user_id: String,
    },
    OrderCreated {
        order_id: Uuid,
        session_id: Uuid,
        shop_id: String,
    },
    SessionMaterialized {
        session_id: Uuid,
        order_count: usize,
        at: DateTime<Utc>,
    },
    DeliveryStatusChanged {
        order_id: Uuid,
        old_status: DeliveryStatus,
        new_status: DeliveryStatus,
    },
}

/// Drains the event channel, logging each event until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::PaymentSessionCreated {
                session_id,
                user_id,
            } => info!(%session_id, %user_id, "payment session created"),
            Event::PaymentSessionReused {
                session_id,
                user_id,
            } => info!(%session_id, %user_id, "payment session reused"),
            Event::PaymentSessionSuperseded {
                session_id,
                user_id,
            } => info!(%session_id, %user_id, "payment session superseded"),
            Event::OrderCreated {
                order_id,
                session_id,
                shop_id,
            } => info!(%order_id, %session_id, %shop_id, "order created"),
            Event::SessionMaterialized {
                session_id,
                order_count,
                at,
            } => info!(%session_id, order_count, %at, "payment session materialized"),
            Event::DeliveryStatusChanged {
                order_id,
                old_status,
                new_status,
            } => info!(
                %order_id,
                old_status = old_status.as_str(),
                new_status = new_status.as_str(),
                "delivery status changed"
            ),
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loop_drains_events_and_stops_when_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let handle = tokio::spawn(process_events(rx));

        sender
            .send(Event::PaymentSessionCreated {
                session_id: Uuid::new_v4(),
                user_id: "u1".into(),
            })
            .await
            .unwrap();
        drop(sender);

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender
            .send(Event::PaymentSessionReused {
                session_id: Uuid::new_v4(),
                user_id: "u1".into(),
            })
            .await
            .is_err());
        // Never panics or errors out
        sender
            .send_or_log(Event::PaymentSessionReused {
                session_id: Uuid::new_v4(),
                user_id: "u1".into(),
            })
            .await;
    }
}
