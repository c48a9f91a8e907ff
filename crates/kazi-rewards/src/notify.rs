//! Best-effort user notifications for reward state changes.
//!
//! Notification delivery is never part of a settlement transaction: the
//! engine sends after commit and only logs a failed send.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kazi_types::{Amount, RewardEventId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

const NOTIFICATION_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Reward recorded but held until the inviter leaves level 0.
    RewardDeferred,
    RewardCredited,
    RewardReversed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user: UserId,
    pub kind: NotificationKind,
    pub message: String,
    pub amount: Amount,
    pub event_id: RewardEventId,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationService for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        info!(
            user = %notification.user,
            kind = ?notification.kind,
            amount = %notification.amount,
            event_id = %notification.event_id,
            "📨 {}",
            notification.message
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationService for NoopNotifier {
    async fn notify(&self, _notification: Notification) -> Result<()> {
        Ok(())
    }
}

/// Fans notifications out to subscribers (push channels, inbox writers).
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl NotificationService for BroadcastNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        let user = notification.user;
        let receivers = self
            .tx
            .send(notification)
            .map_err(|_| anyhow::anyhow!("No notification subscribers for {}", user))?;
        debug!(user = %user, receivers, "Notification broadcast");
        Ok(())
    }
}
