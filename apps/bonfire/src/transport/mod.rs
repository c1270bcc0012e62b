//! Transport session abstraction: one physical connection to a broker,
//! topic subscriptions with in-order delivery, fire-and-forget publishes,
//! and a lifecycle event feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::config::ChatConfig;

pub mod loopback;
pub mod mock;
pub mod websocket;

pub use loopback::{LoopbackBackend, LoopbackTransport};
pub use mock::{MockBackend, MockTransport};
pub use websocket::{WebSocketBackend, WebSocketTransport};

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection attempt timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Connection lifecycle notifications. `Established` is also emitted after a
/// successful redial; `Closed` is terminal for the transport instance.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Established,
    Error(String),
    Closed,
}

/// Capacity of the lifecycle event feed.
const EVENT_CAPACITY: usize = 16;

pub(crate) fn event_channel() -> broadcast::Sender<TransportEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}

/// One broker connection. Implementations: [`WebSocketTransport`] (live),
/// [`LoopbackTransport`] (demo/fallback), [`MockTransport`] (tests).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Registers interest in a topic. Frames arriving on the topic are
    /// delivered to the returned handle in receipt order.
    fn subscribe(&self, topic: &str) -> Subscription;

    /// Fire-and-forget publish. While disconnected this logs and drops the
    /// payload; callers gate sends on connection state.
    async fn publish(&self, destination: &str, payload: Bytes);

    /// Best-effort teardown; idempotent.
    async fn close(&self);

    fn is_connected(&self) -> bool;

    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Capability of dialing a broker. The session manager is agnostic to which
/// backend produced its transport, which is what lets demo mode and tests
/// swap the live broker out.
#[async_trait]
pub trait TransportBackend: Send + Sync {
    async fn connect(
        &self,
        config: &ChatConfig,
        username: &str,
    ) -> TransportResult<Arc<dyn Transport>>;
}

struct TopicSlot {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Shared topic → subscriber fan-out used by every transport implementation.
/// Delivery on one topic preserves arrival order; dead subscribers are
/// pruned on the next delivery.
#[derive(Default)]
pub(crate) struct TopicRegistry {
    next_id: AtomicU64,
    topics: parking_lot::RwLock<HashMap<String, Vec<TopicSlot>>>,
}

impl TopicRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn attach(self: &Arc<Self>, topic: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(TopicSlot { id, tx });
        Subscription {
            topic: topic.to_string(),
            id,
            rx,
            registry: Arc::downgrade(self),
            detached: false,
        }
    }

    pub(crate) fn deliver(&self, topic: &str, payload: Bytes) -> usize {
        let mut guard = self.topics.write();
        let Some(slots) = guard.get_mut(topic) else {
            debug!(target = "bonfire::transport", topic, "frame for unwatched topic dropped");
            return 0;
        };
        slots.retain(|slot| slot.tx.send(payload.clone()).is_ok());
        slots.len()
    }

    pub(crate) fn detach(&self, topic: &str, id: u64) {
        let mut guard = self.topics.write();
        if let Some(slots) = guard.get_mut(topic) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                guard.remove(topic);
            }
        }
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.topics.read().keys().cloned().collect()
    }
}

/// Handle to a topic subscription. Dropping it (or calling
/// [`Subscription::unsubscribe`]) stops further delivery; both are
/// idempotent and safe after the transport has disconnected. A frame that
/// raced past the detach may still sit in the buffer and is simply dropped
/// with the receiver.
pub struct Subscription {
    topic: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Bytes>,
    registry: Weak<TopicRegistry>,
    detached: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Awaits the next frame; `None` once unsubscribed or the transport is
    /// gone and the buffer has drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn unsubscribe(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.topic, self.id);
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_delivers_in_order() {
        let registry = TopicRegistry::new();
        let mut sub = registry.attach("/topic/messages");
        registry.deliver("/topic/messages", Bytes::from_static(b"one"));
        registry.deliver("/topic/messages", Bytes::from_static(b"two"));
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_is_idempotent() {
        let registry = TopicRegistry::new();
        let mut sub = registry.attach("/topic/messages");
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(registry.deliver("/topic/messages", Bytes::from_static(b"x")), 0);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn unsubscribe_after_transport_gone_is_safe() {
        let registry = TopicRegistry::new();
        let mut sub = registry.attach("/topic/users");
        drop(registry);
        sub.unsubscribe();
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn drop_detaches_the_slot() {
        let registry = TopicRegistry::new();
        let sub = registry.attach("/topic/users");
        drop(sub);
        assert!(registry.topics().is_empty());
    }

    #[tokio::test]
    async fn frames_fan_out_to_every_subscriber_of_a_topic() {
        let registry = TopicRegistry::new();
        let mut a = registry.attach("/topic/messages");
        let mut b = registry.attach("/topic/messages");
        assert_eq!(registry.deliver("/topic/messages", Bytes::from_static(b"hi")), 2);
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }
}
