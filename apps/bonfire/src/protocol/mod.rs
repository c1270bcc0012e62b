//! Canonical chat records and the wire shapes the broker speaks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::{Iso8601, Rfc3339};

/// Shared broadcast topic: every connected participant receives these frames.
pub const TOPIC_MESSAGES: &str = "/topic/messages";
/// Shared presence topic carrying roster snapshots.
pub const TOPIC_USERS: &str = "/topic/users";

/// Outbound destination announcing that a user joined.
pub const DEST_ADD_USER: &str = "/app/chat.addUser";
/// Outbound destination for broadcast sends.
pub const DEST_SEND_MESSAGE: &str = "/app/chat.sendMessage";
/// Outbound destination for direct messages.
pub const DEST_SEND_PRIVATE: &str = "/app/chat.sendPrivateMessage";
/// Outbound destination announcing that a user left.
pub const DEST_REMOVE_USER: &str = "/app/chat.removeUser";

/// The per-user queue the broker addresses private messages to.
pub fn private_queue_topic(username: &str) -> String {
    format!("/user/{username}/queue/private")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Broadcast,
    System,
    Private,
}

/// A normalized message record. Immutable once created; `recipient` is
/// present exactly when `kind` is `Private`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub content: String,
    pub timestamp: OffsetDateTime,
    pub kind: MessageKind,
}

/// A known-active participant in the current session.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub joined_at: OffsetDateTime,
}

/// The JSON body of broadcast and private message frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresenceKind {
    Join,
    Leave,
}

/// The JSON body of join/leave announcements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceNotice {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PresenceKind,
}

/// Framing spoken between the client and the broker over the websocket link.
///
/// `connect`/`connected` form the handshake; `subscribe` registers interest
/// in a topic; `publish` carries an outbound body to a destination; `frame`
/// is an inbound delivery on a subscribed topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Connect { username: String, passcode: String },
    Connected,
    Subscribe { topic: String },
    Publish { destination: String, body: Value },
    Frame { topic: String, body: Value },
    Error { message: String },
}

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

/// Lenient ISO-8601-ish parse. Returns `None` rather than erroring so the
/// caller can substitute the receipt time.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(raw, &Iso8601::DEFAULT))
        .ok()
}

/// Collision-resistant message id: nanosecond timestamp plus a random tail.
pub fn generate_message_id(prefix: &str) -> String {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("{prefix}-{nanos}-{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn private_queue_topic_embeds_username() {
        assert_eq!(private_queue_topic("alice"), "/user/alice/queue/private");
    }

    #[test]
    fn wire_message_omits_absent_fields() {
        let wire = WireMessage {
            content: "hello".into(),
            sender: Some("alice".into()),
            recipient: None,
            timestamp: None,
        };
        let raw = serde_json::to_string(&wire).unwrap();
        assert_eq!(raw, r#"{"content":"hello","sender":"alice"}"#);
    }

    #[test]
    fn presence_notice_uses_uppercase_kind() {
        let notice = PresenceNotice {
            name: "bob".into(),
            kind: PresenceKind::Leave,
        };
        let raw = serde_json::to_string(&notice).unwrap();
        assert_eq!(raw, r#"{"name":"bob","type":"LEAVE"}"#);
    }

    #[test]
    fn envelope_round_trips_through_tagged_json() {
        let env = Envelope::Publish {
            destination: DEST_SEND_MESSAGE.into(),
            body: serde_json::json!({ "content": "hi" }),
        };
        let raw = serde_json::to_string(&env).unwrap();
        assert!(raw.contains(r#""kind":"publish""#));
        let back: Envelope = serde_json::from_str(&raw).unwrap();
        match back {
            Envelope::Publish { destination, body } => {
                assert_eq!(destination, DEST_SEND_MESSAGE);
                assert_eq!(body["content"], "hi");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn timestamps_round_trip_through_rfc3339() {
        let ts = datetime!(2024-05-01 12:30:45 UTC);
        let raw = format_timestamp(ts);
        assert_eq!(parse_timestamp(&raw), Some(ts));
    }

    #[test]
    fn parse_timestamp_accepts_fractional_seconds() {
        let parsed = parse_timestamp("2024-05-01T12:30:45.123Z").expect("parses");
        assert_eq!(parsed.unix_timestamp(), datetime!(2024-05-01 12:30:45 UTC).unix_timestamp());
    }

    #[test]
    fn parse_timestamp_rejects_garbage() {
        assert_eq!(parse_timestamp("yesterday-ish"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn generated_ids_carry_prefix_and_differ() {
        let a = generate_message_id("msg");
        let b = generate_message_id("msg");
        assert!(a.starts_with("msg-"));
        assert_ne!(a, b);
    }
}
