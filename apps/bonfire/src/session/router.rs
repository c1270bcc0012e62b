//! Normalization of raw inbound frames into canonical message records.
//!
//! Every defaulting rule here exists so a sparse or sloppy frame still
//! yields a usable record: parse failure is the only reason to drop a
//! frame, and even that only costs the one frame, never the subscription.

use bytes::Bytes;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;

use crate::protocol::{ChatMessage, MessageKind, generate_message_id, parse_timestamp};

/// Sender recorded when a frame does not name one.
pub const UNKNOWN_SENDER: &str = "Unknown";

/// Turns a raw frame into a canonical record, or `None` when the payload is
/// not a JSON object (logged and dropped).
pub fn normalize(payload: &Bytes, kind: MessageKind, received_at: OffsetDateTime) -> Option<ChatMessage> {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!(
                target = "bonfire::router",
                error = %err,
                "unparseable frame dropped"
            );
            return None;
        }
    };
    let Some(fields) = value.as_object() else {
        warn!(target = "bonfire::router", "non-object frame dropped");
        return None;
    };

    let id = fields
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| generate_message_id(id_prefix(kind)));
    let sender = fields
        .get("sender")
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN_SENDER)
        .to_string();
    let recipient = match kind {
        MessageKind::Private => fields
            .get("recipient")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    let content = fields
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let timestamp = fields
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or(received_at);

    Some(ChatMessage {
        id,
        sender,
        recipient,
        content,
        timestamp,
        kind,
    })
}

fn id_prefix(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Private => "private",
        _ => "msg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn bare_content_normalizes_with_defaults() {
        let received = now();
        let message = normalize(
            &Bytes::from_static(br#"{"content":"hello"}"#),
            MessageKind::Broadcast,
            received,
        )
        .expect("normalizes");
        assert!(!message.id.is_empty());
        assert!(message.id.starts_with("msg-"));
        assert_eq!(message.sender, UNKNOWN_SENDER);
        assert_eq!(message.content, "hello");
        assert_eq!(message.timestamp, received);
        assert!(message.timestamp <= now());
        assert_eq!(message.kind, MessageKind::Broadcast);
        assert_eq!(message.recipient, None);
    }

    #[test]
    fn wire_fields_are_preserved_when_present() {
        let message = normalize(
            &Bytes::from_static(
                br#"{"id":"m-1","content":"hi","sender":"bob","timestamp":"2024-05-01T12:30:45Z"}"#,
            ),
            MessageKind::Broadcast,
            now(),
        )
        .expect("normalizes");
        assert_eq!(message.id, "m-1");
        assert_eq!(message.sender, "bob");
        assert_eq!(message.timestamp.unix_timestamp(), 1_714_566_645);
    }

    #[test]
    fn private_frames_carry_kind_recipient_and_prefix() {
        let message = normalize(
            &Bytes::from_static(br#"{"content":"psst","sender":"bob","recipient":"alice"}"#),
            MessageKind::Private,
            now(),
        )
        .expect("normalizes");
        assert_eq!(message.kind, MessageKind::Private);
        assert_eq!(message.recipient.as_deref(), Some("alice"));
        assert!(message.id.starts_with("private-"));
    }

    #[test]
    fn unparseable_timestamp_falls_back_to_receipt_time() {
        let received = now();
        let message = normalize(
            &Bytes::from_static(br#"{"content":"x","timestamp":"not-a-date"}"#),
            MessageKind::Broadcast,
            received,
        )
        .expect("normalizes");
        assert_eq!(message.timestamp, received);
    }

    #[test]
    fn missing_content_becomes_empty_string() {
        let message = normalize(
            &Bytes::from_static(br#"{"sender":"bob"}"#),
            MessageKind::Broadcast,
            now(),
        )
        .expect("normalizes");
        assert_eq!(message.content, "");
    }

    #[test]
    fn malformed_payloads_are_dropped_not_panicked() {
        assert!(normalize(&Bytes::from_static(b"not json"), MessageKind::Broadcast, now()).is_none());
        assert!(normalize(&Bytes::from_static(b"[1,2,3]"), MessageKind::Broadcast, now()).is_none());
        assert!(normalize(&Bytes::from_static(b"\"just a string\""), MessageKind::Private, now()).is_none());
    }
}
