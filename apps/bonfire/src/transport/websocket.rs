//! Live broker backend over a websocket link.
//!
//! The connection handshake exchanges `connect`/`connected` envelopes and is
//! raced against the configured timeout. After that a single pump task owns
//! the socket: it forwards queued publishes, fans inbound frames out to
//! topic subscribers, pings on the heartbeat cadence, and redials (then
//! re-subscribes every registered topic) when the link drops out from under
//! us.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use super::{
    Subscription, TopicRegistry, Transport, TransportBackend, TransportError, TransportEvent,
    TransportResult, event_channel,
};
use crate::config::ChatConfig;
use crate::protocol::Envelope;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketBackend;

#[async_trait]
impl TransportBackend for WebSocketBackend {
    async fn connect(
        &self,
        config: &ChatConfig,
        username: &str,
    ) -> TransportResult<Arc<dyn Transport>> {
        let transport = WebSocketTransport::connect(config, username).await?;
        Ok(Arc::new(transport))
    }
}

enum OutboundCmd {
    Envelope(Envelope),
    Shutdown,
}

struct WsShared {
    registry: Arc<TopicRegistry>,
    outbound: mpsc::UnboundedSender<OutboundCmd>,
    connected: AtomicBool,
    closing: AtomicBool,
    close_notify: Notify,
    events: broadcast::Sender<TransportEvent>,
}

struct DialPlan {
    url: Url,
    username: String,
    passcode: String,
    connect_timeout: Duration,
    reconnect_delay: Option<Duration>,
    heartbeat_interval: Option<Duration>,
}

pub struct WebSocketTransport {
    shared: Arc<WsShared>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport").finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    pub async fn connect(config: &ChatConfig, username: &str) -> TransportResult<Self> {
        let plan = DialPlan {
            url: config.broker_url().clone(),
            username: username.to_string(),
            passcode: config.passcode().to_string(),
            connect_timeout: config.connect_timeout(),
            reconnect_delay: config.reconnect_delay(),
            heartbeat_interval: config.heartbeat_interval(),
        };
        let stream = handshake(&plan).await?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(WsShared {
            registry: TopicRegistry::new(),
            outbound,
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            close_notify: Notify::new(),
            events: event_channel(),
        });
        tokio::spawn(run_pump(plan, shared.clone(), stream, outbound_rx));
        let _ = shared.events.send(TransportEvent::Established);
        Ok(Self { shared })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn subscribe(&self, topic: &str) -> Subscription {
        let subscription = self.shared.registry.attach(topic);
        // The pump re-issues subscribes for every registered topic after a
        // redial, so a send that races a dropped link is not lost.
        let _ = self
            .shared
            .outbound
            .send(OutboundCmd::Envelope(Envelope::Subscribe {
                topic: topic.to_string(),
            }));
        subscription
    }

    async fn publish(&self, destination: &str, payload: Bytes) {
        if !self.is_connected() {
            warn!(
                target = "bonfire::transport",
                destination, "publish while disconnected dropped"
            );
            return;
        }
        let body = match serde_json::from_slice(&payload) {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    target = "bonfire::transport",
                    destination,
                    error = %err,
                    "unencodable publish payload dropped"
                );
                return;
            }
        };
        let _ = self
            .shared
            .outbound
            .send(OutboundCmd::Envelope(Envelope::Publish {
                destination: destination.to_string(),
                body,
            }));
    }

    async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.close_notify.notify_waiters();
        let _ = self.shared.outbound.send(OutboundCmd::Shutdown);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

/// Dial + `connect`/`connected` exchange, raced against the connect timeout.
async fn handshake(plan: &DialPlan) -> TransportResult<WsStream> {
    let attempt = async {
        let (mut stream, _) = connect_async(plan.url.as_str())
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let hello = Envelope::Connect {
            username: plan.username.clone(),
            passcode: plan.passcode.clone(),
        };
        let raw = serde_json::to_string(&hello)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        stream
            .send(Message::Text(raw))
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(raw))) => match serde_json::from_str(&raw) {
                    Ok(Envelope::Connected) => return Ok(stream),
                    Ok(Envelope::Error { message }) => {
                        return Err(TransportError::Protocol(message));
                    }
                    Ok(other) => {
                        return Err(TransportError::Protocol(format!(
                            "unexpected envelope before ack: {other:?}"
                        )));
                    }
                    Err(err) => {
                        return Err(TransportError::Protocol(format!(
                            "malformed handshake reply: {err}"
                        )));
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(other)) => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected handshake message: {other:?}"
                    )));
                }
                Some(Err(err)) => return Err(TransportError::Network(err.to_string())),
                None => {
                    return Err(TransportError::Network(
                        "connection closed during handshake".into(),
                    ));
                }
            }
        }
    };
    tokio::time::timeout(plan.connect_timeout, attempt)
        .await
        .map_err(|_| TransportError::Timeout)?
}

async fn run_pump(
    plan: DialPlan,
    shared: Arc<WsShared>,
    mut stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundCmd>,
) {
    let heartbeat_period = plan
        .heartbeat_interval
        .unwrap_or(Duration::from_secs(3600));
    'link: loop {
        let (mut sink, mut read) = stream.split();
        let mut heartbeat = tokio::time::interval(heartbeat_period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                cmd = outbound_rx.recv() => match cmd {
                    Some(OutboundCmd::Envelope(envelope)) => {
                        let raw = match serde_json::to_string(&envelope) {
                            Ok(raw) => raw,
                            Err(err) => {
                                warn!(target = "bonfire::transport", error = %err, "dropping unencodable envelope");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(raw)).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundCmd::Shutdown) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break 'link;
                    }
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(raw))) => handle_inbound(&shared, raw.as_bytes()),
                    Some(Ok(Message::Binary(data))) => handle_inbound(&shared, &data),
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                },
                _ = heartbeat.tick() => {
                    if plan.heartbeat_interval.is_some()
                        && sink.send(Message::Ping(Vec::new())).await.is_err()
                    {
                        break;
                    }
                }
            }
        }

        // Link lost without a local close.
        shared.connected.store(false, Ordering::SeqCst);
        if shared.closing.load(Ordering::SeqCst) {
            break;
        }
        let _ = shared
            .events
            .send(TransportEvent::Error("connection lost".into()));
        let Some(delay) = plan.reconnect_delay else {
            break;
        };

        loop {
            if tokio::time::timeout(delay, shared.close_notify.notified())
                .await
                .is_ok()
                || shared.closing.load(Ordering::SeqCst)
            {
                break 'link;
            }
            match handshake(&plan).await {
                Ok(mut fresh) => {
                    let mut resubscribed = true;
                    for topic in shared.registry.topics() {
                        let envelope = Envelope::Subscribe { topic };
                        let raw = serde_json::to_string(&envelope).expect("subscribe envelope");
                        if fresh.send(Message::Text(raw)).await.is_err() {
                            resubscribed = false;
                            break;
                        }
                    }
                    if !resubscribed {
                        continue;
                    }
                    debug!(target = "bonfire::transport", "broker link re-established");
                    stream = fresh;
                    shared.connected.store(true, Ordering::SeqCst);
                    let _ = shared.events.send(TransportEvent::Established);
                    continue 'link;
                }
                Err(err) => {
                    debug!(target = "bonfire::transport", error = %err, "redial failed, retrying");
                }
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
    let _ = shared.events.send(TransportEvent::Closed);
}

fn handle_inbound(shared: &WsShared, raw: &[u8]) {
    match serde_json::from_slice::<Envelope>(raw) {
        Ok(Envelope::Frame { topic, body }) => {
            let payload = match serde_json::to_vec(&body) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(target = "bonfire::transport", error = %err, "frame body dropped");
                    return;
                }
            };
            shared.registry.deliver(&topic, Bytes::from(payload));
        }
        Ok(Envelope::Error { message }) => {
            warn!(target = "bonfire::transport", message = %message, "broker reported error");
            let _ = shared.events.send(TransportEvent::Error(message));
        }
        Ok(other) => {
            debug!(target = "bonfire::transport", envelope = ?other, "ignoring envelope");
        }
        Err(err) => {
            warn!(
                target = "bonfire::transport",
                error = %err,
                "malformed inbound frame dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DEST_SEND_MESSAGE, TOPIC_MESSAGES};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimal in-process broker: acks the handshake, then loops broadcast
    /// publishes back as frames on the messages topic.
    async fn spawn_broker() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(raw) = msg else { continue };
                match serde_json::from_str::<Envelope>(&raw).unwrap() {
                    Envelope::Connect { .. } => {
                        let ack = serde_json::to_string(&Envelope::Connected).unwrap();
                        ws.send(Message::Text(ack)).await.unwrap();
                    }
                    Envelope::Publish { destination, body } if destination == DEST_SEND_MESSAGE => {
                        let frame = serde_json::to_string(&Envelope::Frame {
                            topic: TOPIC_MESSAGES.into(),
                            body,
                        })
                        .unwrap();
                        ws.send(Message::Text(frame)).await.unwrap();
                    }
                    _ => {}
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn connects_subscribes_and_receives_frames() {
        let addr = spawn_broker().await;
        let config = ChatConfig::new(format!("ws://{addr}/ws")).unwrap();
        let transport = WebSocketTransport::connect(&config, "alice").await.unwrap();
        assert!(transport.is_connected());

        let mut sub = transport.subscribe(TOPIC_MESSAGES);
        transport
            .publish(
                DEST_SEND_MESSAGE,
                Bytes::from_static(br#"{"content":"hello","sender":"alice"}"#),
            )
            .await;

        let frame = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("frame within deadline")
            .expect("subscription alive");
        let body: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(body["content"], "hello");
        transport.close().await;
    }

    #[tokio::test]
    async fn silent_broker_yields_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            // Swallow the connect envelope and never ack.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let config = ChatConfig::new(format!("ws://{addr}/ws"))
            .unwrap()
            .with_connect_timeout(Duration::from_millis(200));
        let err = WebSocketTransport::connect(&config, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn unreachable_broker_yields_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ChatConfig::new(format!("ws://{addr}/ws"))
            .unwrap()
            .with_connect_timeout(Duration::from_secs(2));
        let err = WebSocketTransport::connect(&config, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }
}
