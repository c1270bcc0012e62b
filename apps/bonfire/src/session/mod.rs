//! Session management: one broker connection bound to a username, with the
//! roster, conversation logs, and observer fan-out hanging off it.

pub mod observers;
pub mod roster;
pub mod router;
pub mod store;

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ChatConfig;
use crate::protocol::{
    ChatMessage, DEST_ADD_USER, DEST_REMOVE_USER, DEST_SEND_MESSAGE, DEST_SEND_PRIVATE,
    MessageKind, Participant, PresenceKind, PresenceNotice, TOPIC_MESSAGES, TOPIC_USERS,
    WireMessage, format_timestamp, generate_message_id, private_queue_topic,
};
use crate::transport::{
    LoopbackBackend, Subscription, Transport, TransportBackend, TransportError, TransportEvent,
    WebSocketBackend,
};
use observers::{ObserverHandle, ObserverSet};
use roster::RosterReconciler;
use store::ConversationStore;

/// Sender name used for locally generated system messages.
pub const SYSTEM_SENDER: &str = "System";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// `demo` marks a session running against the loop-back fallback
    /// because the live broker was unreachable.
    Connected { demo: bool },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("session is already connected")]
    AlreadyConnected,
    #[error("invalid chat configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct SessionShared {
    state: parking_lot::Mutex<SessionState>,
    transport: parking_lot::Mutex<Option<Arc<dyn Transport>>>,
    local: parking_lot::Mutex<Option<String>>,
    roster: RosterReconciler,
    store: ConversationStore,
    broadcast_observers: ObserverSet<ChatMessage>,
    presence_observers: ObserverSet<[Participant]>,
    private_observers: ObserverSet<ChatMessage>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// One chat session. Instances are independent: each owns its transport,
/// roster, and conversation logs, so tests (or a future multi-account UI)
/// can run several side by side.
pub struct ChatSession {
    config: ChatConfig,
    backend: Arc<dyn TransportBackend>,
    shared: Arc<SessionShared>,
}

impl ChatSession {
    pub fn new(config: ChatConfig) -> Self {
        Self::with_backend(config, Arc::new(WebSocketBackend))
    }

    /// Builds a session over an explicit backend: the loop-back backend for
    /// offline use, or a scripted double in tests.
    pub fn with_backend(config: ChatConfig, backend: Arc<dyn TransportBackend>) -> Self {
        Self {
            config,
            backend,
            shared: Arc::new(SessionShared {
                state: parking_lot::Mutex::new(SessionState::Disconnected),
                transport: parking_lot::Mutex::new(None),
                local: parking_lot::Mutex::new(None),
                roster: RosterReconciler::new(),
                store: ConversationStore::new(),
                broadcast_observers: ObserverSet::new(),
                presence_observers: ObserverSet::new(),
                private_observers: ObserverSet::new(),
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connects as `username`, announces the join, and starts routing
    /// inbound frames. With fallback enabled a dead broker degrades to the
    /// loop-back backend instead of failing.
    pub async fn connect(&self, username: &str) -> Result<(), SessionError> {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(SessionError::EmptyUsername);
        }
        {
            let mut state = self.shared.state.lock();
            if !matches!(*state, SessionState::Disconnected) {
                return Err(SessionError::AlreadyConnected);
            }
            *state = SessionState::Connecting;
        }

        let (transport, demo) = match self.backend.connect(&self.config, &username).await {
            Ok(transport) => (transport, false),
            Err(err) if self.config.fallback_enabled() => {
                warn!(
                    target = "bonfire::session",
                    error = %err,
                    "broker unreachable, falling back to demo mode"
                );
                match LoopbackBackend.connect(&self.config, &username).await {
                    Ok(transport) => (transport, true),
                    Err(err) => {
                        *self.shared.state.lock() = SessionState::Disconnected;
                        return Err(err.into());
                    }
                }
            }
            Err(err) => {
                *self.shared.state.lock() = SessionState::Disconnected;
                return Err(err.into());
            }
        };

        self.shared.roster.bind_local(&username);
        *self.shared.local.lock() = Some(username.clone());

        // Seed the roster so the caller never observes one without
        // themselves in it, even before the broker's first snapshot.
        let seeded = self
            .shared
            .roster
            .apply_snapshot(&Bytes::from_static(b"[]"), OffsetDateTime::now_utc());
        self.shared.presence_observers.notify(&seeded);

        let messages = transport.subscribe(TOPIC_MESSAGES);
        let users = transport.subscribe(TOPIC_USERS);
        let private = transport.subscribe(&private_queue_topic(&username));
        let events = transport.events();
        {
            let mut tasks = self.shared.tasks.lock();
            tasks.push(tokio::spawn(drain_broadcast(messages, self.shared.clone())));
            tasks.push(tokio::spawn(drain_roster(users, self.shared.clone())));
            tasks.push(tokio::spawn(drain_private(
                private,
                self.shared.clone(),
                username.clone(),
            )));
            tasks.push(tokio::spawn(watch_lifecycle(events, self.shared.clone())));
        }

        let notice = PresenceNotice {
            name: username.clone(),
            kind: PresenceKind::Join,
        };
        publish_json(transport.as_ref(), DEST_ADD_USER, &notice).await;

        let system = ChatMessage {
            id: generate_message_id("msg"),
            sender: SYSTEM_SENDER.to_string(),
            recipient: None,
            content: format!("{username} joined the chat"),
            timestamp: OffsetDateTime::now_utc(),
            kind: MessageKind::System,
        };
        self.shared.store.append_broadcast(system.clone());
        self.shared.broadcast_observers.notify(&system);

        *self.shared.transport.lock() = Some(transport);
        *self.shared.state.lock() = SessionState::Connected { demo };
        debug!(target = "bonfire::session", username = %username, demo, "session connected");
        Ok(())
    }

    /// Announces the leave, tears the transport down, and clears all
    /// session-scoped state. Valid from any state; a second call is a
    /// no-op.
    pub async fn disconnect(&self) {
        let transport = self.shared.transport.lock().take();
        let local = self.shared.local.lock().take();
        *self.shared.state.lock() = SessionState::Disconnected;

        if let Some(transport) = transport {
            if let Some(name) = local {
                let notice = PresenceNotice {
                    name,
                    kind: PresenceKind::Leave,
                };
                publish_json(transport.as_ref(), DEST_REMOVE_USER, &notice).await;
            }
            transport.close().await;
        }

        let tasks: Vec<JoinHandle<()>> = self.shared.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.shared.roster.clear();
        self.shared.store.clear();
    }

    /// Publishes to the shared broadcast topic. A blank message or a
    /// disconnected session makes this a logged no-op.
    pub async fn send_broadcast(&self, content: &str) {
        let content = content.trim();
        if content.is_empty() {
            debug!(target = "bonfire::session", "blank broadcast ignored");
            return;
        }
        let Some((transport, sender)) = self.send_context() else {
            debug!(target = "bonfire::session", "broadcast while not connected ignored");
            return;
        };
        let wire = WireMessage {
            content: content.to_string(),
            sender: Some(sender),
            recipient: None,
            timestamp: Some(format_timestamp(OffsetDateTime::now_utc())),
        };
        publish_json(transport.as_ref(), DEST_SEND_MESSAGE, &wire).await;
    }

    /// Publishes a direct message and immediately appends the outgoing copy
    /// to the local private log, so the sender sees their message without a
    /// broker round trip. The broker's echo of our own frames is suppressed
    /// on receipt.
    pub async fn send_private(&self, content: &str, recipient: &str) {
        let content = content.trim();
        let recipient = recipient.trim();
        if content.is_empty() || recipient.is_empty() {
            debug!(target = "bonfire::session", "blank private message ignored");
            return;
        }
        let Some((transport, sender)) = self.send_context() else {
            debug!(target = "bonfire::session", "private send while not connected ignored");
            return;
        };
        let now = OffsetDateTime::now_utc();
        let wire = WireMessage {
            content: content.to_string(),
            sender: Some(sender.clone()),
            recipient: Some(recipient.to_string()),
            timestamp: Some(format_timestamp(now)),
        };
        publish_json(transport.as_ref(), DEST_SEND_PRIVATE, &wire).await;

        let message = ChatMessage {
            id: generate_message_id("private"),
            sender,
            recipient: Some(recipient.to_string()),
            content: content.to_string(),
            timestamp: now,
            kind: MessageKind::Private,
        };
        self.shared.store.append_private(message.clone());
        self.shared.private_observers.notify(&message);
    }

    pub fn observe_broadcast(
        &self,
        callback: impl Fn(&ChatMessage) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.shared.broadcast_observers.register(callback)
    }

    pub fn observe_presence(
        &self,
        callback: impl Fn(&[Participant]) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.shared.presence_observers.register(callback)
    }

    pub fn observe_private(
        &self,
        callback: impl Fn(&ChatMessage) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.shared.private_observers.register(callback)
    }

    /// The private history with `peer`, oldest first.
    pub fn thread_for(&self, peer: &str) -> Vec<ChatMessage> {
        match self.local_username() {
            Some(local) => self.shared.store.thread_for(&local, peer),
            None => Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn local_username(&self) -> Option<String> {
        self.shared.local.lock().clone()
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.shared.roster.participants()
    }

    pub fn broadcast_log(&self) -> Vec<ChatMessage> {
        self.shared.store.broadcast_log()
    }

    pub fn private_log(&self) -> Vec<ChatMessage> {
        self.shared.store.private_log()
    }

    fn send_context(&self) -> Option<(Arc<dyn Transport>, String)> {
        if !matches!(self.state(), SessionState::Connected { .. }) {
            return None;
        }
        let transport = self.shared.transport.lock().clone()?;
        let sender = self.shared.local.lock().clone()?;
        Some((transport, sender))
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn publish_json<T: Serialize>(transport: &dyn Transport, destination: &str, body: &T) {
    match serde_json::to_vec(body) {
        Ok(payload) => transport.publish(destination, Bytes::from(payload)).await,
        Err(err) => warn!(
            target = "bonfire::session",
            destination,
            error = %err,
            "outbound payload serialization failed"
        ),
    }
}

async fn drain_broadcast(mut subscription: Subscription, shared: Arc<SessionShared>) {
    while let Some(payload) = subscription.recv().await {
        let received = OffsetDateTime::now_utc();
        if let Some(message) = router::normalize(&payload, MessageKind::Broadcast, received) {
            shared.store.append_broadcast(message.clone());
            shared.broadcast_observers.notify(&message);
        }
    }
}

async fn drain_private(mut subscription: Subscription, shared: Arc<SessionShared>, local: String) {
    while let Some(payload) = subscription.recv().await {
        let received = OffsetDateTime::now_utc();
        let Some(message) = router::normalize(&payload, MessageKind::Private, received) else {
            continue;
        };
        // The optimistic copy appended at send time is authoritative for
        // our own messages; a broker echo would duplicate the thread.
        if message.sender == local {
            debug!(
                target = "bonfire::session",
                id = %message.id,
                "suppressed broker echo of own private message"
            );
            continue;
        }
        shared.store.append_private(message.clone());
        shared.private_observers.notify(&message);
    }
}

async fn drain_roster(mut subscription: Subscription, shared: Arc<SessionShared>) {
    while let Some(payload) = subscription.recv().await {
        let roster = shared
            .roster
            .apply_snapshot(&payload, OffsetDateTime::now_utc());
        shared.presence_observers.notify(&roster);
    }
}

async fn watch_lifecycle(
    mut events: broadcast::Receiver<TransportEvent>,
    shared: Arc<SessionShared>,
) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Closed) => {
                let mut state = shared.state.lock();
                if matches!(*state, SessionState::Connected { .. }) {
                    warn!(
                        target = "bonfire::session",
                        "transport closed underneath a connected session"
                    );
                    *state = SessionState::Disconnected;
                }
            }
            Ok(TransportEvent::Error(message)) => {
                warn!(target = "bonfire::session", message = %message, "transport error");
            }
            Ok(TransportEvent::Established) => {
                debug!(target = "bonfire::session", "transport established");
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
