//! Demo/fallback backend: the same transport contract, wired to an
//! in-process bus instead of a live broker.
//!
//! Outbound destinations are mapped to the local effects a broker would have
//! produced, so a session running against this backend still sees its own
//! traffic: joins yield a single-user roster snapshot, broadcast sends echo
//! on the broadcast topic, and private sends reach the local user's own
//! queue. The session manager never learns which backend it is talking to.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chat_bus::{Bus, LocalBus};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    Subscription, TopicRegistry, Transport, TransportBackend, TransportEvent, TransportResult,
    event_channel,
};
use crate::config::ChatConfig;
use crate::protocol::{
    DEST_ADD_USER, DEST_REMOVE_USER, DEST_SEND_MESSAGE, DEST_SEND_PRIVATE, TOPIC_MESSAGES,
    TOPIC_USERS, WireMessage, format_timestamp, private_queue_topic,
};

pub struct LoopbackBackend;

#[async_trait]
impl TransportBackend for LoopbackBackend {
    async fn connect(
        &self,
        _config: &ChatConfig,
        username: &str,
    ) -> TransportResult<Arc<dyn Transport>> {
        Ok(Arc::new(LoopbackTransport::new(username)))
    }
}

pub struct LoopbackTransport {
    username: String,
    bus: Arc<LocalBus>,
    registry: Arc<TopicRegistry>,
    bridged: parking_lot::Mutex<HashSet<String>>,
    bridges: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl LoopbackTransport {
    pub fn new(username: &str) -> Self {
        let transport = Self {
            username: username.to_string(),
            bus: Arc::new(LocalBus::new()),
            registry: TopicRegistry::new(),
            bridged: parking_lot::Mutex::new(HashSet::new()),
            bridges: parking_lot::Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            events: event_channel(),
        };
        let _ = transport.events.send(TransportEvent::Established);
        transport
    }

    /// Moves frames from the bus into the topic registry. One bridge per
    /// topic, regardless of how many subscriptions attach to it.
    fn ensure_bridge(&self, topic: &str) {
        if !self.bridged.lock().insert(topic.to_string()) {
            return;
        }
        let mut rx = self.bus.subscribe(topic);
        let registry = self.registry.clone();
        let topic = topic.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        registry.deliver(&topic, frame.payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target = "bonfire::transport",
                            topic = %topic,
                            skipped,
                            "loop-back bridge lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.bridges.lock().push(handle);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn subscribe(&self, topic: &str) -> Subscription {
        self.ensure_bridge(topic);
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
        match destination {
            DEST_SEND_MESSAGE => {
                self.bus.publish(TOPIC_MESSAGES, payload);
            }
            DEST_SEND_PRIVATE => {
                let recipient = serde_json::from_slice::<WireMessage>(&payload)
                    .ok()
                    .and_then(|wire| wire.recipient);
                if recipient.as_deref() == Some(self.username.as_str()) {
                    self.bus
                        .publish(&private_queue_topic(&self.username), payload);
                } else {
                    debug!(
                        target = "bonfire::transport",
                        recipient = recipient.as_deref().unwrap_or(""),
                        "loop-back has no route to remote peer, frame dropped"
                    );
                }
            }
            DEST_ADD_USER => {
                let snapshot = json!([{
                    "id": self.username,
                    "name": self.username,
                    "joinedAt": format_timestamp(OffsetDateTime::now_utc()),
                }]);
                self.bus
                    .publish(TOPIC_USERS, Bytes::from(snapshot.to_string()));
            }
            DEST_REMOVE_USER => {
                debug!(target = "bonfire::transport", "loop-back leave is a no-op");
            }
            other => {
                warn!(
                    target = "bonfire::transport",
                    destination = other,
                    "unknown destination, frame dropped"
                );
            }
        }
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.bridges.lock().drain(..) {
            handle.abort();
        }
        let _ = self.events.send(TransportEvent::Closed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv_within(sub: &mut Subscription, ms: u64) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_millis(ms), sub.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn join_announcement_yields_single_user_snapshot() {
        let transport = LoopbackTransport::new("alice");
        let mut users = transport.subscribe(TOPIC_USERS);
        transport
            .publish(DEST_ADD_USER, Bytes::from_static(b"{\"name\":\"alice\",\"type\":\"JOIN\"}"))
            .await;
        let payload = recv_within(&mut users, 1000).await.expect("snapshot");
        let snapshot: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(snapshot[0]["name"], "alice");
    }

    #[tokio::test]
    async fn broadcast_send_echoes_locally() {
        let transport = LoopbackTransport::new("alice");
        let mut messages = transport.subscribe(TOPIC_MESSAGES);
        transport
            .publish(
                DEST_SEND_MESSAGE,
                Bytes::from_static(br#"{"content":"hi","sender":"alice"}"#),
            )
            .await;
        let payload = recv_within(&mut messages, 1000).await.expect("echo");
        let body: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(body["content"], "hi");
    }

    #[tokio::test]
    async fn private_send_reaches_own_queue_only() {
        let transport = LoopbackTransport::new("alice");
        let mut queue = transport.subscribe(&private_queue_topic("alice"));

        transport
            .publish(
                DEST_SEND_PRIVATE,
                Bytes::from_static(br#"{"content":"note to self","sender":"alice","recipient":"alice"}"#),
            )
            .await;
        assert!(recv_within(&mut queue, 1000).await.is_some());

        transport
            .publish(
                DEST_SEND_PRIVATE,
                Bytes::from_static(br#"{"content":"hi bob","sender":"alice","recipient":"bob"}"#),
            )
            .await;
        assert!(recv_within(&mut queue, 100).await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_gates_publishes() {
        let transport = LoopbackTransport::new("alice");
        let mut messages = transport.subscribe(TOPIC_MESSAGES);
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_connected());
        transport
            .publish(DEST_SEND_MESSAGE, Bytes::from_static(br#"{"content":"x"}"#))
            .await;
        assert!(recv_within(&mut messages, 100).await.is_none());
    }
}
