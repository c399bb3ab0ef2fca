//! Push Notification
//!
//! Per-session broadcast channels for push events, and the injectable
//! connection interface the client agent subscribes through. Delivery is best
//! effort: a lagging or absent subscriber simply misses events and falls back
//! to polling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::GameError;
use crate::game::session::SessionId;
use crate::network::protocol::PushEvent;

/// Default per-session channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Server-side sink for push events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish an event to the session's subscribers.
    async fn publish(&self, event: PushEvent);

    /// Release everything held for a session that no longer exists.
    async fn close_session(&self, _session_id: SessionId) {}
}

/// Client-side push connection with an explicit lifecycle.
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Open the connection.
    async fn connect(&self) -> Result<(), GameError>;

    /// Receive events for one session.
    async fn subscribe(&self, session_id: SessionId) -> Result<broadcast::Receiver<PushEvent>, GameError>;

    /// Close the connection.
    async fn disconnect(&self);
}

/// Broadcast channel per session.
pub struct SessionChannels {
    channels: RwLock<BTreeMap<SessionId, broadcast::Sender<PushEvent>>>,
    capacity: usize,
}

impl Default for SessionChannels {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl SessionChannels {
    /// Create with a channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a session, creating its channel on first use.
    pub async fn subscribe(&self, session_id: SessionId) -> broadcast::Receiver<PushEvent> {
        if let Some(tx) = self.channels.read().await.get(&session_id) {
            return tx.subscribe();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Active subscribers of a session.
    pub async fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.channels
            .read()
            .await
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a session's channel. Subscribers see the stream close.
    pub async fn close(&self, session_id: &SessionId) {
        self.channels.write().await.remove(session_id);
    }

    /// Sessions with an open channel.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[async_trait]
impl Notifier for SessionChannels {
    async fn publish(&self, event: PushEvent) {
        let channels = self.channels.read().await;
        let Some(tx) = channels.get(&event.session_id) else {
            debug!(session = %event.session_id, kind = event.kind(), "No subscribers for push");
            return;
        };
        let kind = event.kind();
        let session_id = event.session_id;
        // Err only means nobody is listening right now.
        if let Ok(delivered) = tx.send(event) {
            debug!(session = %session_id, kind, delivered, "Push published");
        }
    }

    async fn close_session(&self, session_id: SessionId) {
        self.close(&session_id).await;
    }
}

/// In-process connector over [`SessionChannels`].
pub struct LocalConnector {
    channels: Arc<SessionChannels>,
    connected: AtomicBool,
}

impl LocalConnector {
    /// Create a disconnected connector.
    pub fn new(channels: Arc<SessionChannels>) -> Self {
        Self { channels, connected: AtomicBool::new(false) }
    }

    /// Whether `connect` has been called without a later `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushConnector for LocalConnector {
    async fn connect(&self) -> Result<(), GameError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, session_id: SessionId) -> Result<broadcast::Receiver<PushEvent>, GameError> {
        if !self.is_connected() {
            return Err(GameError::Transport("push connection is not open".to_string()));
        }
        Ok(self.channels.subscribe(session_id).await)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{PushPayload, SettlementNotice};
    use chrono::Utc;
    use uuid::Uuid;

    fn notice(session_id: SessionId) -> PushEvent {
        PushEvent::new(
            session_id,
            Utc::now(),
            PushPayload::SettlementApplied(SettlementNotice { winner: None, transferred_points: 5 }),
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_only_that_session() {
        let channels = SessionChannels::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = channels.subscribe(a).await;
        let mut rx_b = channels.subscribe(b).await;

        channels.publish(notice(a)).await;

        assert_eq!(rx_a.recv().await.unwrap().session_id, a);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(channels.subscriber_count(&a).await, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let channels = SessionChannels::default();
        channels.publish(notice(Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn test_connector_lifecycle() {
        let channels = Arc::new(SessionChannels::default());
        let connector = LocalConnector::new(channels.clone());
        let id = Uuid::new_v4();

        assert!(connector.subscribe(id).await.is_err());
        connector.connect().await.unwrap();
        let mut rx = connector.subscribe(id).await.unwrap();
        channels.publish(notice(id)).await;
        assert_eq!(rx.recv().await.unwrap().transferred_points(), Some(5));

        connector.disconnect().await;
        assert!(!connector.is_connected());
    }
}
