//! Event store: ordered listings, head discovery, missing-event queries
//!
//! All orderings are (lamport_clock ascending, event_id byte-ordinal
//! ascending) so every replica lists the same event set in the same order.

use crate::error::SyncError;
use crate::storage::{EventLogEdge, EventLogEntry, EventTables, StorageError};
use std::collections::HashSet;
use std::sync::Arc;
use tavern_core::codec;
use tavern_core::types::{EventKind, EventRecord, SessionId};
use tavern_core::VectorClock;
use tracing::warn;

/// Append-only DAG store over the durable event tables
pub struct EventStore {
    tables: Arc<dyn EventTables>,
}

impl EventStore {
    pub fn new(tables: Arc<dyn EventTables>) -> Self {
        Self { tables }
    }

    /// Persist one record and its parent edges in a single transaction
    pub async fn append(&self, record: &EventRecord) -> Result<(), SyncError> {
        self.append_all(std::slice::from_ref(record)).await
    }

    /// Persist a batch of records atomically (all rows or none)
    pub async fn append_all(&self, records: &[EventRecord]) -> Result<(), SyncError> {
        let mut entries = Vec::with_capacity(records.len());
        let mut edges = Vec::new();
        for record in records {
            entries.push(entry_from_record(record)?);
            for parent_id in &record.parents {
                edges.push(EventLogEdge {
                    session_id: record.session_id,
                    event_id: record.event_id.clone(),
                    parent_id: parent_id.clone(),
                });
            }
        }
        self.tables.insert_batch(entries, edges).await?;
        Ok(())
    }

    /// Which of `candidate_ids` are already stored for the session
    pub async fn lookup_existing_ids(
        &self,
        session_id: SessionId,
        candidate_ids: &[String],
    ) -> Result<HashSet<String>, SyncError> {
        Ok(self.tables.contains_ids(session_id, candidate_ids).await?)
    }

    /// All events for a session in canonical order. Rows that fail to parse
    /// are skipped with a warning rather than failing the whole read.
    pub async fn list(&self, session_id: SessionId) -> Result<Vec<EventRecord>, SyncError> {
        let rows = self.tables.entries_for_session(session_id).await?;
        let mut records: Vec<EventRecord> = rows
            .into_iter()
            .filter_map(|row| match record_from_entry(&row) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(
                        session_id,
                        event_id = %row.event_id,
                        error = %err,
                        "skipping undecodable event row"
                    );
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| {
            a.lamport_clock
                .cmp(&b.lamport_clock)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        Ok(records)
    }

    /// Canonical listing minus the ids the caller already knows
    pub async fn list_missing(
        &self,
        session_id: SessionId,
        known_ids: &HashSet<String>,
    ) -> Result<Vec<EventRecord>, SyncError> {
        let mut records = self.list(session_id).await?;
        records.retain(|record| !known_ids.contains(&record.event_id));
        Ok(records)
    }

    /// Events no other event lists as a parent, byte-ordinal ascending.
    /// These are the only acceptable parent set for a new local event.
    pub async fn heads(&self, session_id: SessionId) -> Result<Vec<String>, SyncError> {
        let rows = self.tables.entries_for_session(session_id).await?;
        let referenced = self.tables.parent_ids_for_session(session_id).await?;
        let mut heads: Vec<String> = rows
            .into_iter()
            .map(|row| row.event_id)
            .filter(|event_id| !referenced.contains(event_id))
            .collect();
        heads.sort();
        Ok(heads)
    }

    /// Every entry row across all sessions, for engine warm-up
    pub(crate) async fn all_entries(&self) -> Result<Vec<EventLogEntry>, StorageError> {
        self.tables.all_entries().await
    }
}

/// Flatten a record into its persisted row form
pub(crate) fn entry_from_record(record: &EventRecord) -> Result<EventLogEntry, SyncError> {
    Ok(EventLogEntry {
        session_id: record.session_id,
        event_id: record.event_id.clone(),
        event_type: record.kind.as_str().to_string(),
        payload: codec::canonical_payload(&record.body)?,
        parents: serde_json::to_string(&record.parents).map_err(StorageError::from)?,
        vector_clock: record.vector_clock.to_json(),
        lamport_clock: record.lamport_clock,
        created_at: record.timestamp,
        is_imported: record.is_imported,
    })
}

/// Rebuild a typed record from a persisted row
pub(crate) fn record_from_entry(entry: &EventLogEntry) -> Result<EventRecord, SyncError> {
    let kind = EventKind::from_str_name(&entry.event_type).ok_or_else(|| {
        SyncError::Storage(StorageError::Transaction(format!(
            "unknown event_type {}",
            entry.event_type
        )))
    })?;
    let body = codec::parse_payload(kind, &entry.payload)?;
    let parents: Vec<String> = serde_json::from_str(&entry.parents).map_err(StorageError::from)?;
    let vector_clock = VectorClock::from_json(&entry.vector_clock).map_err(StorageError::from)?;
    Ok(EventRecord {
        event_id: entry.event_id.clone(),
        session_id: entry.session_id,
        kind,
        lamport_clock: entry.lamport_clock,
        timestamp: entry.created_at,
        parents,
        vector_clock,
        body,
        is_imported: entry.is_imported,
    })
}
