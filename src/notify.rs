use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingRequested,
    BookingConfirmed,
    BookingCancelled,
    HoldExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub action_url: String,
}

#[derive(Debug)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification delivery failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Where lifecycle notifications go. Delivery is fire-and-forget: the engine
/// logs errors and carries on.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// In-process broadcast hub, one channel per user.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a user's notifications. Creates the channel if needed.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop a user's channel once nobody listens any more.
    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl NotificationSink for NotifyHub {
    /// No-op if nobody is listening.
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        if let Some(sender) = self.channels.get(&notification.user_id) {
            let _ = sender.send(notification);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed(user: &str) -> Notification {
        Notification {
            user_id: user.into(),
            kind: NotificationKind::BookingConfirmed,
            message: "Your booking is confirmed".into(),
            action_url: "/rentals/1".into(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("renter_1");

        hub.notify(confirmed("renter_1")).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, confirmed("renter_1"));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber, still not an error
        assert!(hub.notify(confirmed("nobody")).is_ok());
    }

    #[tokio::test]
    async fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe("gone");
        let _kept = hub.subscribe("kept");
        drop(rx);
        hub.prune();
        assert_eq!(hub.channels.len(), 1);
        assert!(hub.channels.contains_key("kept"));
    }
}
