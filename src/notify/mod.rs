//! User Notifications
//! Fire-and-forget alerts; delivery failures are never fatal

use async_nats::Client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    LiquidityRequest,
    BuybackOffer,
    BuybackFilled,
    Award,
    TradeFailed,
    Dilution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: Uuid, kind: NotificationKind, title: &str, message: String) -> Self {
        Self {
            user_id,
            kind,
            title: title.to_string(),
            message,
            data: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Publishes each notification as JSON on `<prefix>.<user_id>`.
pub struct NatsNotifier {
    client: Client,
    subject_prefix: String,
}

impl NatsNotifier {
    pub fn new(client: Client, subject_prefix: impl Into<String>) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.into(),
        }
    }
}

#[async_trait]
impl Notifier for NatsNotifier {
    async fn send(&self, notification: Notification) -> anyhow::Result<()> {
        let subject = format!("{}.{}", self.subject_prefix, notification.user_id);
        let payload = serde_json::to_vec(&notification)?;
        self.client.publish(subject, payload.into()).await?;
        Ok(())
    }
}

/// Keeps notifications in memory; used by tests and local runs.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, user_id: Uuid) -> Vec<Notification> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: Notification) -> anyhow::Result<()> {
        tracing::debug!(
            user_id = %notification.user_id,
            kind = ?notification.kind,
            "Notification recorded"
        );
        self.sent.lock().await.push(notification);
        Ok(())
    }
}
