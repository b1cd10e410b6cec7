//! Buyer e-mails and persisted in-app notifications for sellers and admins.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Set};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::entities::notification;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("Mail delivery failed: {0}")]
    Delivery(String),
}

/// A templated e-mail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub template: String,
    pub context: Value,
}

/// Outbound e-mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), NotificationError>;
}

/// Writes e-mails to the log instead of delivering them. Used when no
/// transport is configured.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), NotificationError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            template = %message.template,
            "E-mail queued"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub title: String,
    pub message: String,
    pub creator_id: String,
    pub receiver_id: String,
    pub redirect_link: Option<String>,
}

/// Persists in-app notifications.
#[derive(Debug, Clone, Default)]
pub struct NotificationService;

impl NotificationService {
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip(self, db, new), fields(receiver_id = %new.receiver_id))]
    pub async fn create<C: ConnectionTrait>(
        &self,
        db: &C,
        new: NewNotification,
    ) -> Result<notification::Model, NotificationError> {
        let model = notification::ActiveModel {
            id: Set(Uuid::new_v4()),
            title: Set(new.title),
            message: Set(new.message),
            creator_id: Set(new.creator_id),
            receiver_id: Set(new.receiver_id),
            redirect_link: Set(new.redirect_link),
            is_read: Set(false),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await?;

        Ok(model)
    }
}
