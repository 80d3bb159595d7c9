//! Canonical encoding and content-addressed event ids
//!
//! The canonical pre-image of an event is the `|`-joined concatenation of
//! its scalar fields, canonical vector clock, ordinally-sorted parent ids,
//! and payload JSON. `event_id` is the uppercase-hex SHA-256 of that
//! pre-image, which lets any peer recompute and verify ids on import.

use crate::error::{CoreError, Result};
use crate::types::*;
use crate::VectorClock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Field separator in the canonical pre-image (ASCII 0x7C)
const SEPARATOR: u8 = b'|';

/// Serialize a payload as canonical JSON: camelCase properties, no
/// whitespace, null-valued properties omitted. Serde emits struct fields in
/// declaration order with no padding, so the output is deterministic.
pub fn canonical_payload(body: &EventBody) -> Result<String> {
    let json = match body {
        EventBody::ChatMessage(b) => serde_json::to_string(b)?,
        EventBody::Presence(b) => serde_json::to_string(b)?,
        EventBody::FlagUpdate(b) => serde_json::to_string(b)?,
        EventBody::DiceRoll(b) => serde_json::to_string(b)?,
    };
    Ok(json)
}

/// Parse a payload JSON string back into a typed body for the given kind
pub fn parse_payload(kind: EventKind, payload: &str) -> Result<EventBody> {
    let body = match kind {
        EventKind::ChatMessage => EventBody::ChatMessage(serde_json::from_str(payload)?),
        EventKind::Presence => EventBody::Presence(serde_json::from_str(payload)?),
        EventKind::FlagUpdate => EventBody::FlagUpdate(serde_json::from_str(payload)?),
        EventKind::DiceRoll => EventBody::DiceRoll(serde_json::from_str(payload)?),
    };
    Ok(body)
}

/// Assemble the canonical pre-image for an event.
///
/// `session_id | kind | lamport | timestamp_millis | clock_canonical |
/// parent_1 | ... | parent_N | payload_json`, parents sorted byte-ordinal
/// ascending.
pub fn canonical_pre_image(
    session_id: SessionId,
    kind: EventKind,
    lamport_clock: u64,
    timestamp: DateTime<Utc>,
    vector_clock: &VectorClock,
    parents: &[String],
    payload_json: &str,
) -> Vec<u8> {
    let mut sorted: Vec<&String> = parents.iter().collect();
    sorted.sort();

    let mut out = Vec::with_capacity(128 + payload_json.len());
    out.extend_from_slice(session_id.to_string().as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(kind.wire_number().to_string().as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(lamport_clock.to_string().as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(timestamp.timestamp_millis().to_string().as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(vector_clock.canonical().as_bytes());
    for parent in sorted {
        out.push(SEPARATOR);
        out.extend_from_slice(parent.as_bytes());
    }
    out.push(SEPARATOR);
    out.extend_from_slice(payload_json.as_bytes());
    out
}

/// Compute the content-addressed id for an event record (ignoring any id
/// already present on the record)
pub fn compute_event_id(record: &EventRecord) -> Result<String> {
    let payload = canonical_payload(&record.body)?;
    let pre_image = canonical_pre_image(
        record.session_id,
        record.kind,
        record.lamport_clock,
        record.timestamp,
        &record.vector_clock,
        &record.parents,
        &payload,
    );
    Ok(hex::encode_upper(Sha256::digest(&pre_image)))
}

/// Verify that a record's transmitted id matches its recomputed id
pub fn verify_event_id(record: &EventRecord) -> Result<()> {
    let computed = compute_event_id(record)?;
    if computed != record.event_id {
        return Err(CoreError::ContentHashMismatch {
            computed,
            transmitted: record.event_id.clone(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wire representation
// ---------------------------------------------------------------------------

/// Flat wire record mirroring [`EventRecord`], with vector clock and body
/// rendered as JSON strings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub event_id: String,
    pub session_id: SessionId,
    pub kind: u8,
    pub lamport_clock: u64,
    pub timestamp: DateTime<Utc>,
    pub vector_clock_json: String,
    pub parents: Vec<String>,
    pub payload: String,
}

impl WireEvent {
    /// Flatten a record for transfer
    pub fn from_record(record: &EventRecord) -> Result<Self> {
        Ok(Self {
            event_id: record.event_id.clone(),
            session_id: record.session_id,
            kind: record.kind.wire_number(),
            lamport_clock: record.lamport_clock,
            timestamp: record.timestamp,
            vector_clock_json: record.vector_clock.to_json(),
            parents: record.parents.clone(),
            payload: canonical_payload(&record.body)?,
        })
    }

    /// Rebuild a typed record; imported events are marked as such
    pub fn into_record(self) -> Result<EventRecord> {
        let kind = EventKind::from_wire(self.kind).ok_or(CoreError::UnknownKind(self.kind))?;
        let body = parse_payload(kind, &self.payload)?;
        let vector_clock = VectorClock::from_json(&self.vector_clock_json)?;
        let mut parents = self.parents;
        parents.sort();
        Ok(EventRecord {
            event_id: self.event_id,
            session_id: self.session_id,
            kind,
            lamport_clock: self.lamport_clock,
            timestamp: self.timestamp,
            parents,
            vector_clock,
            body,
            is_imported: true,
        })
    }
}

/// Serialize a batch of records as a JSON array; an empty batch serializes
/// as the empty string
pub fn encode_batch(records: &[EventRecord]) -> Result<String> {
    if records.is_empty() {
        return Ok(String::new());
    }
    let wire: Vec<WireEvent> = records
        .iter()
        .map(WireEvent::from_record)
        .collect::<Result<_>>()?;
    Ok(serde_json::to_string(&wire)?)
}

/// Parse a wire batch; the empty string decodes as an empty batch
pub fn decode_batch(batch: &str) -> Result<Vec<EventRecord>> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }
    let wire: Vec<WireEvent> = serde_json::from_str(batch)?;
    wire.into_iter().map(WireEvent::into_record).collect()
}
