// ABOUTME: Fire-and-forget user notifications emitted by job workers
// ABOUTME: Ships a tracing-backed notifier and a tokio broadcast notifier for live subscribers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: i64,
    pub message: String,
    pub level: NotifyLevel,
}

/// Delivery never fails the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: i64, message: &str, level: NotifyLevel);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: i64, message: &str, level: NotifyLevel) {
        match level {
            NotifyLevel::Error => error!("[user {}] {}", user_id, message),
            NotifyLevel::Info | NotifyLevel::Success => info!("[user {}] {}", user_id, message),
        }
    }
}

/// Publishes notifications on a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, user_id: i64, message: &str, level: NotifyLevel) {
        let notification = Notification {
            user_id,
            message: message.to_string(),
            level,
        };
        if self.sender.send(notification).is_err() {
            debug!("No subscribers for notification to user {}", user_id);
        }
    }
}
