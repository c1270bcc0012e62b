//! In-memory conversation logs: the broadcast timeline and the private
//! message log, with per-peer thread views computed on demand.

use crate::protocol::ChatMessage;

#[derive(Default)]
pub struct ConversationStore {
    broadcast: parking_lot::RwLock<Vec<ChatMessage>>,
    private: parking_lot::RwLock<Vec<ChatMessage>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append-only; arrival order is the display order. Dedup is the
    /// sender's responsibility via client-generated ids.
    pub fn append_broadcast(&self, message: ChatMessage) {
        self.broadcast.write().push(message);
    }

    pub fn append_private(&self, message: ChatMessage) {
        self.private.write().push(message);
    }

    pub fn broadcast_log(&self) -> Vec<ChatMessage> {
        self.broadcast.read().clone()
    }

    pub fn private_log(&self) -> Vec<ChatMessage> {
        self.private.read().clone()
    }

    /// The ordered private history between `local` and `peer`. Recomputed
    /// per call; at chat scale that beats maintaining per-peer indices.
    pub fn thread_for(&self, local: &str, peer: &str) -> Vec<ChatMessage> {
        self.private
            .read()
            .iter()
            .filter(|message| {
                let to = message.recipient.as_deref();
                (message.sender == local && to == Some(peer))
                    || (message.sender == peer && to == Some(local))
            })
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.broadcast.write().clear();
        self.private.write().clear();
    }
}
