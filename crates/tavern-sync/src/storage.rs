//! Durable event tables over sled
//!
//! Two trees mirror the relational layout: `event_log_entries` holds one
//! row per event with (session_id, event_id) unique, `event_log_edges`
//! holds one row per (child, parent). Batch inserts commit in a single
//! transaction across both trees so imports are all-or-nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("duplicate event: {0}")]
    DuplicateEvent(String),
    #[error("transaction failed: {0}")]
    Transaction(String),
}

/// One persisted event row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub session_id: i64,
    pub event_id: String,
    pub event_type: String,
    /// Kind-specific body JSON, exactly as hashed into the event id
    pub payload: String,
    /// JSON array of parent event ids
    pub parents: String,
    /// JSON object form of the vector clock
    pub vector_clock: String,
    pub lamport_clock: u64,
    pub created_at: DateTime<Utc>,
    pub is_imported: bool,
}

/// One parent edge row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventLogEdge {
    pub session_id: i64,
    pub event_id: String,
    pub parent_id: String,
}

/// Transactional access to the two event tables
#[async_trait]
pub trait EventTables: Send + Sync {
    /// Insert entries and edges atomically; an existing (session, event)
    /// key aborts the whole batch
    async fn insert_batch(
        &self,
        entries: Vec<EventLogEntry>,
        edges: Vec<EventLogEdge>,
    ) -> Result<(), StorageError>;

    /// Which of `candidate_ids` already exist in the session
    async fn contains_ids(
        &self,
        session_id: i64,
        candidate_ids: &[String],
    ) -> Result<HashSet<String>, StorageError>;

    /// All entry rows for a session, storage order
    async fn entries_for_session(&self, session_id: i64)
        -> Result<Vec<EventLogEntry>, StorageError>;

    /// Every event id referenced as a parent within the session
    async fn parent_ids_for_session(
        &self,
        session_id: i64,
    ) -> Result<HashSet<String>, StorageError>;

    /// All entry rows across all sessions (engine warm-up)
    async fn all_entries(&self) -> Result<Vec<EventLogEntry>, StorageError>;
}

/// Sled-backed implementation of the event tables
pub struct SledTables {
    _db: Db,
    entries: Tree,
    edges: Tree,
}

impl SledTables {
    /// Open (or create) the tables under the given directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let entries = db.open_tree("event_log_entries")?;
        let edges = db.open_tree("event_log_edges")?;
        Ok(Self {
            _db: db,
            entries,
            edges,
        })
    }

    fn entry_key(session_id: i64, event_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + event_id.len());
        key.extend_from_slice(&session_id.to_be_bytes());
        key.extend_from_slice(event_id.as_bytes());
        key
    }

    fn edge_key(edge: &EventLogEdge) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + edge.event_id.len() + edge.parent_id.len());
        key.extend_from_slice(&edge.session_id.to_be_bytes());
        key.extend_from_slice(edge.event_id.as_bytes());
        key.extend_from_slice(edge.parent_id.as_bytes());
        key
    }
}

#[async_trait]
impl EventTables for SledTables {
    async fn insert_batch(
        &self,
        entries: Vec<EventLogEntry>,
        edges: Vec<EventLogEdge>,
    ) -> Result<(), StorageError> {
        // Serialize outside the transaction closure; it may retry
        let entry_rows: Vec<(Vec<u8>, Vec<u8>, String)> = entries
            .iter()
            .map(|entry| {
                Ok((
                    Self::entry_key(entry.session_id, &entry.event_id),
                    serde_json::to_vec(entry)?,
                    entry.event_id.clone(),
                ))
            })
            .collect::<Result<_, StorageError>>()?;
        let edge_rows: Vec<(Vec<u8>, Vec<u8>)> = edges
            .iter()
            .map(|edge| Ok((Self::edge_key(edge), serde_json::to_vec(edge)?)))
            .collect::<Result<_, StorageError>>()?;

        (&self.entries, &self.edges)
            .transaction(|(entry_tree, edge_tree)| {
                for (key, value, event_id) in &entry_rows {
                    if entry_tree.get(key)?.is_some() {
                        return Err(ConflictableTransactionError::Abort(event_id.clone()));
                    }
                    entry_tree.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &edge_rows {
                    edge_tree.insert(key.as_slice(), value.as_slice())?;
                }
                Ok(())
            })
            .map_err(|err| match err {
                TransactionError::Abort(event_id) => StorageError::DuplicateEvent(event_id),
                TransactionError::Storage(e) => StorageError::Sled(e),
            })
    }

    async fn contains_ids(
        &self,
        session_id: i64,
        candidate_ids: &[String],
    ) -> Result<HashSet<String>, StorageError> {
        let mut present = HashSet::new();
        for event_id in candidate_ids {
            if self
                .entries
                .contains_key(Self::entry_key(session_id, event_id))?
            {
                present.insert(event_id.clone());
            }
        }
        Ok(present)
    }

    async fn entries_for_session(
        &self,
        session_id: i64,
    ) -> Result<Vec<EventLogEntry>, StorageError> {
        let mut rows = Vec::new();
        for item in self.entries.scan_prefix(session_id.to_be_bytes()) {
            let (_, value) = item?;
            rows.push(serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }

    async fn parent_ids_for_session(
        &self,
        session_id: i64,
    ) -> Result<HashSet<String>, StorageError> {
        let mut parents = HashSet::new();
        for item in self.edges.scan_prefix(session_id.to_be_bytes()) {
            let (_, value) = item?;
            let edge: EventLogEdge = serde_json::from_slice(&value)?;
            parents.insert(edge.parent_id);
        }
        Ok(parents)
    }

    async fn all_entries(&self) -> Result<Vec<EventLogEntry>, StorageError> {
        let mut rows = Vec::new();
        for item in self.entries.iter() {
            let (_, value) = item?;
            rows.push(serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }
}
