use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::broadcast;

/// Per-topic fan-out capacity. Chat traffic is low-volume; a subscriber that
/// lags this far behind observes a `Lagged` gap rather than unbounded growth.
const TOPIC_CAPACITY: usize = 128;

/// A frame delivered on a named topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFrame {
    pub topic: String,
    pub payload: Bytes,
}

/// Topic-addressed publish/subscribe fan-out.
///
/// Publishing is fire-and-forget: a frame published to a topic nobody is
/// watching is simply dropped, mirroring broker semantics for broadcast
/// topics.
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<TopicFrame>;

    /// Publishes a frame, returning how many live subscribers received it.
    fn publish(&self, topic: &str, payload: Bytes) -> usize;
}

/// In-memory bus backing the loop-back transport and tests.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<TopicFrame>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<TopicFrame> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<TopicFrame> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> usize {
        self.sender_for(topic)
            .send(TopicFrame {
                topic: topic.to_string(),
                payload,
            })
            .unwrap_or(0)
    }
}
