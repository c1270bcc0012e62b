//! Scriptable transport double for session-level tests: records publishes,
//! lets tests inject inbound frames, and exposes the lifecycle feed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::warn;

use super::{
    Subscription, TopicRegistry, Transport, TransportBackend, TransportEvent, TransportResult,
    event_channel,
};
use crate::config::ChatConfig;

pub struct MockTransport {
    registry: Arc<TopicRegistry>,
    published: parking_lot::Mutex<Vec<(String, Bytes)>>,
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: TopicRegistry::new(),
            published: parking_lot::Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            events: event_channel(),
        })
    }

    /// Delivers a raw frame as if the broker sent it; returns how many
    /// subscriptions received it.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        self.registry.deliver(topic, payload.into())
    }

    /// Everything published so far, in order, as `(destination, payload)`.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, destination: &str) -> Vec<Bytes> {
        self.published
            .lock()
            .iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn emit(&self, event: TransportEvent) {
        if matches!(event, TransportEvent::Closed) {
            self.connected.store(false, Ordering::SeqCst);
        }
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn subscribe(&self, topic: &str) -> Subscription {
        self.registry.attach(topic)
    }

    async fn publish(&self, destination: &str, payload: Bytes) {
        if !self.is_connected() {
            warn!(
                target = "bonfire::transport",
                destination, "publish while disconnected dropped"
            );
            return;
        }
        self.published
            .lock()
            .push((destination.to_string(), payload));
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Backend handing out one shared [`MockTransport`], so a test can drive the
/// broker side of a session it constructed.
pub struct MockBackend {
    transport: Arc<MockTransport>,
    connected_username: parking_lot::Mutex<Option<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            transport: MockTransport::new(),
            connected_username: parking_lot::Mutex::new(None),
        }
    }

    pub fn transport(&self) -> Arc<MockTransport> {
        self.transport.clone()
    }

    pub fn connected_username(&self) -> Option<String> {
        self.connected_username.lock().clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportBackend for MockBackend {
    async fn connect(
        &self,
        _config: &ChatConfig,
        username: &str,
    ) -> TransportResult<Arc<dyn Transport>> {
        *self.connected_username.lock() = Some(username.to_string());
        Ok(self.transport.clone())
    }
}
