//! Pending-task notification.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::PendingTask;
use crate::Result;

/// Identifier of the single pending-task notification.
pub const PENDING_NOTIFICATION_ID: &str = "pending-tasks";

/// Badge/alert describing the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingNotification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub count: usize,
    pub next_expiration: Option<DateTime<Utc>>,
    /// Play sound/vibration. Only set when tasks were added.
    pub alert: bool,
}

impl PendingNotification {
    /// Build the notification for a non-empty queue.
    pub fn for_tasks(tasks: &[PendingTask], alert: bool) -> Option<Self> {
        if tasks.is_empty() {
            return None;
        }

        let count = tasks.len();
        let next_expiration = tasks.iter().filter_map(|t| t.expires_at).min();

        let title = if count == 1 {
            "You have 1 pending task.".to_string()
        } else {
            format!("You have {} pending tasks.", count)
        };

        let body = match next_expiration {
            Some(at) => format!("Next expiration: {}", at.format("%Y-%m-%d %H:%M UTC")),
            None if count == 1 => "This task does not expire.".to_string(),
            None => "These tasks do not expire.".to_string(),
        };

        Some(Self {
            id: PENDING_NOTIFICATION_ID.to_string(),
            title,
            body,
            count,
            next_expiration,
            alert,
        })
    }
}

/// Destination of the pending-task notification.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Show or replace the notification.
    async fn issue(&self, notification: PendingNotification) -> Result<()>;

    /// Remove the notification.
    async fn cancel(&self, id: &str) -> Result<()>;
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn issue(&self, notification: PendingNotification) -> Result<()> {
        info!(
            id = %notification.id,
            count = notification.count,
            alert = notification.alert,
            "{} {}",
            notification.title,
            notification.body
        );
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        info!(id = %id, "Pending task notification cleared");
        Ok(())
    }
}
