//! Event log data model for Tavern sessions
//!
//! Events form a content-addressed DAG per session. Payload structs here are
//! serialized as camelCase JSON with null fields omitted; that JSON is part
//! of the canonical pre-image (see [`crate::codec`]), so field order and
//! naming are wire-stable.

use crate::clock::VectorClock;
use crate::dice::DiceEvidence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Session identifier assigned by the embedding application
pub type SessionId = i64;

/// Event kind with stable wire numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    ChatMessage = 0,
    Presence = 1,
    FlagUpdate = 2,
    DiceRoll = 3,
}

impl EventKind {
    /// Stable wire number used in the canonical pre-image
    pub fn wire_number(self) -> u8 {
        self as u8
    }

    /// Parse a wire number
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ChatMessage),
            1 => Some(Self::Presence),
            2 => Some(Self::FlagUpdate),
            3 => Some(Self::DiceRoll),
            _ => None,
        }
    }

    /// Stable name used in the `event_type` column
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::Presence => "presence",
            Self::FlagUpdate => "flag_update",
            Self::DiceRoll => "dice_roll",
        }
    }

    /// Parse the `event_type` column value
    pub fn from_str_name(name: &str) -> Option<Self> {
        match name {
            "chat_message" => Some(Self::ChatMessage),
            "presence" => Some(Self::Presence),
            "flag_update" => Some(Self::FlagUpdate),
            "dice_roll" => Some(Self::DiceRoll),
            _ => None,
        }
    }
}

/// Chat message payload with an optional ordering anchor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageBody {
    pub message_id: Uuid,
    pub peer_id: String,
    pub device_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Event id of the message this one sorts after; None appends at the end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_event_id: Option<String>,
}

/// Last-writer-wins presence payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceBody {
    pub peer_id: String,
    pub is_online: bool,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub device_name: String,
    pub change_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Last-writer-wins session flag payload; a null value deletes the key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagUpdateBody {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub change_id: Uuid,
}

/// Signed dice roll payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceRollBody {
    pub evidence: DiceEvidence,
    /// Base64 Ed25519 signature over the canonical evidence bytes
    pub signature: String,
}

/// Union of all event payloads
#[derive(Clone, Debug, PartialEq)]
pub enum EventBody {
    ChatMessage(ChatMessageBody),
    Presence(PresenceBody),
    FlagUpdate(FlagUpdateBody),
    DiceRoll(DiceRollBody),
}

impl EventBody {
    /// Kind discriminant for this payload
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ChatMessage(_) => EventKind::ChatMessage,
            Self::Presence(_) => EventKind::Presence,
            Self::FlagUpdate(_) => EventKind::FlagUpdate,
            Self::DiceRoll(_) => EventKind::DiceRoll,
        }
    }
}

/// One event in a session's DAG
///
/// `event_id` is the uppercase-hex SHA-256 of the canonical pre-image and is
/// the only valid identifier of the event. Records are immutable once
/// persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub event_id: String,
    pub session_id: SessionId,
    pub kind: EventKind,
    pub lamport_clock: u64,
    pub timestamp: DateTime<Utc>,
    /// Parent event ids, sorted byte-ordinal ascending
    pub parents: Vec<String>,
    pub vector_clock: VectorClock,
    pub body: EventBody,
    /// True when the event arrived via import rather than local append
    pub is_imported: bool,
}

// ---------------------------------------------------------------------------
// Materialized session state
// ---------------------------------------------------------------------------

/// One chat message in its converged position
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageState {
    pub event_id: String,
    pub message_id: Uuid,
    pub peer_id: String,
    pub device_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Winning presence entry for one peer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub peer_id: String,
    pub device_name: String,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub event_id: String,
}

/// Winning flag entry for one key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagState {
    pub key: String,
    pub value: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub event_id: String,
}

/// One dice roll with its verification result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceRollState {
    pub event_id: String,
    pub evidence: DiceEvidence,
    pub signature_valid: bool,
}

/// Deterministic fold of a session's event set
///
/// Two replicas holding the same events materialize equal states.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub chat: Vec<ChatMessageState>,
    pub presence: BTreeMap<String, PresenceState>,
    pub flags: BTreeMap<String, FlagState>,
    pub dice_history: Vec<DiceRollState>,
}

/// Truncate to millisecond precision, matching the canonical pre-image
/// resolution so persisted and recomputed timestamps agree byte-for-byte.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_numbers_stable() {
        assert_eq!(EventKind::ChatMessage.wire_number(), 0);
        assert_eq!(EventKind::Presence.wire_number(), 1);
        assert_eq!(EventKind::FlagUpdate.wire_number(), 2);
        assert_eq!(EventKind::DiceRoll.wire_number(), 3);
        for n in 0..4u8 {
            assert_eq!(EventKind::from_wire(n).unwrap().wire_number(), n);
        }
        assert!(EventKind::from_wire(4).is_none());
    }

    #[test]
    fn test_kind_names_roundtrip() {
        for kind in [
            EventKind::ChatMessage,
            EventKind::Presence,
            EventKind::FlagUpdate,
            EventKind::DiceRoll,
        ] {
            assert_eq!(EventKind::from_str_name(kind.as_str()), Some(kind));
        }
        assert!(EventKind::from_str_name("mystery").is_none());
    }

    #[test]
    fn test_null_fields_omitted() {
        let body = FlagUpdateBody {
            key: "world".into(),
            value: None,
            version: 1,
            updated_at: now_millis(),
            change_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("value"));

        let with_value = FlagUpdateBody {
            value: Some("alpha".into()),
            ..body
        };
        let json = serde_json::to_string(&with_value).unwrap();
        assert!(json.contains("\"value\":\"alpha\""));
    }

    #[test]
    fn test_now_millis_truncates() {
        let ts = now_millis();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
