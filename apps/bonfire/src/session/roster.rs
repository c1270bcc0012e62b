//! Presence-roster reconciliation.
//!
//! The broker's snapshots are taken as hints, not truth: they may arrive as
//! a single object or an array, entries may lack ids or join times, and a
//! stale snapshot can omit the requesting user entirely. Reconciliation
//! produces a de-duplicated roster that always contains the local user.

use std::collections::HashSet;

use bytes::Bytes;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;

use crate::protocol::{Participant, parse_timestamp};

pub struct RosterReconciler {
    local: parking_lot::RwLock<Option<String>>,
    participants: parking_lot::RwLock<Vec<Participant>>,
}

impl RosterReconciler {
    pub fn new() -> Self {
        Self {
            local: parking_lot::RwLock::new(None),
            participants: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn bind_local(&self, username: &str) {
        *self.local.write() = Some(username.to_string());
    }

    pub fn clear(&self) {
        *self.local.write() = None;
        self.participants.write().clear();
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.participants.read().clone()
    }

    /// Reconciles one raw presence payload and returns the new roster.
    /// Malformed input degrades to a roster of just the local user.
    pub fn apply_snapshot(&self, payload: &Bytes, received_at: OffsetDateTime) -> Vec<Participant> {
        let entries = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Array(items)) => items
                .iter()
                .filter_map(|item| normalize_entry(item, received_at))
                .collect(),
            Ok(value @ Value::Object(_)) => {
                normalize_entry(&value, received_at).into_iter().collect()
            }
            Ok(other) => {
                warn!(
                    target = "bonfire::roster",
                    payload = %other,
                    "unusable presence payload, keeping local user only"
                );
                Vec::new()
            }
            Err(err) => {
                warn!(
                    target = "bonfire::roster",
                    error = %err,
                    "unparseable presence payload, keeping local user only"
                );
                Vec::new()
            }
        };

        let mut seen = HashSet::new();
        let mut roster: Vec<Participant> = entries
            .into_iter()
            .filter(|participant: &Participant| seen.insert(participant.id.clone()))
            .collect();

        // A snapshot that omits the requester would otherwise leave the
        // caller watching a roster without themselves in it.
        if let Some(local) = self.local.read().clone() {
            if !roster.iter().any(|participant| participant.name == local) {
                roster.push(Participant {
                    id: local.clone(),
                    name: local,
                    joined_at: received_at,
                });
            }
        }

        *self.participants.write() = roster.clone();
        roster
    }
}

impl Default for RosterReconciler {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_entry(value: &Value, received_at: OffsetDateTime) -> Option<Participant> {
    let fields = value.as_object()?;
    let name = fields
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| fields.get("username").and_then(Value::as_str))
        .unwrap_or("Unknown")
        .to_string();
    let id = fields
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            fields
                .get("name")
                .or_else(|| fields.get("username"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("user-{:08x}", rand::random::<u32>()));
    let joined_at = fields
        .get("joinedAt")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or(received_at);
    Some(Participant {
        id,
        name,
        joined_at,
    })
}
