//! Sync engine facade
//!
//! Single entry point for producing and consuming session events. Appends
//! and imports serialize through one write gate; reads go straight to the
//! store and rely on its snapshot semantics. The cached global lamport and
//! per-session merged vector clocks are only touched under the gate.

use crate::error::SyncError;
use crate::materialize::materialize;
use crate::storage::EventTables;
use crate::store::EventStore;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tavern_core::codec;
use tavern_core::identity::Identity;
use tavern_core::types::*;
use tavern_core::VectorClock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct EngineInner {
    global_lamport: u64,
    session_clocks: HashMap<SessionId, VectorClock>,
}

/// Orchestrates identity, clocks, codec, store, and materialization
pub struct SyncEngine {
    identity: Arc<Identity>,
    store: EventStore,
    inner: Mutex<EngineInner>,
    ready: AtomicBool,
}

impl SyncEngine {
    pub fn new(identity: Arc<Identity>, tables: Arc<dyn EventTables>) -> Self {
        Self {
            identity,
            store: EventStore::new(tables),
            inner: Mutex::new(EngineInner {
                global_lamport: 0,
                session_clocks: HashMap::new(),
            }),
            ready: AtomicBool::new(false),
        }
    }

    /// This replica's peer id
    pub fn peer_id(&self) -> &str {
        self.identity.peer_id()
    }

    /// Idempotent warm-up: load the max lamport across all sessions and one
    /// merged vector clock per session
    pub async fn initialize(&self) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut max_lamport = 0u64;
        let mut session_clocks: HashMap<SessionId, VectorClock> = HashMap::new();
        for entry in self.store.all_entries().await? {
            max_lamport = max_lamport.max(entry.lamport_clock);
            if let Ok(clock) = VectorClock::from_json(&entry.vector_clock) {
                let merged = session_clocks
                    .entry(entry.session_id)
                    .or_default()
                    .merge(&clock);
                session_clocks.insert(entry.session_id, merged);
            }
        }

        info!(
            peer_id = %self.identity.peer_id(),
            max_lamport,
            sessions = session_clocks.len(),
            "sync engine initialized"
        );
        inner.global_lamport = max_lamport;
        inner.session_clocks = session_clocks;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), SyncError> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SyncError::NotInitialized)
        }
    }

    /// Append a locally produced event.
    ///
    /// Parents are the current session heads; the vector clock is the cached
    /// session clock incremented in our own slot; the lamport counter is the
    /// global monotone. Cancellation before the persist commits nothing.
    pub async fn append_local_event(
        &self,
        session_id: SessionId,
        body: EventBody,
        cancel: &CancellationToken,
    ) -> Result<EventRecord, SyncError> {
        self.ensure_ready()?;
        let mut inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let parents = self.store.heads(session_id).await?;
        let vector_clock = inner
            .session_clocks
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
            .increment(self.identity.peer_id());
        let lamport_clock = inner.global_lamport + 1;

        let mut record = EventRecord {
            event_id: String::new(),
            session_id,
            kind: body.kind(),
            lamport_clock,
            timestamp: now_millis(),
            parents,
            vector_clock: vector_clock.clone(),
            body,
            is_imported: false,
        };
        record.event_id = codec::compute_event_id(&record)?;

        // Last cancellation point before the commit; afterwards the append
        // is complete
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.store.append(&record).await?;

        inner.global_lamport = lamport_clock;
        inner.session_clocks.insert(session_id, vector_clock);
        debug!(
            session_id,
            event_id = %record.event_id,
            lamport_clock,
            "appended local event"
        );
        Ok(record)
    }

    /// Import remote events.
    ///
    /// Events are sorted canonically, deduplicated against the store, and
    /// verified: any transmitted id that disagrees with its recomputed id
    /// aborts the entire batch before anything is persisted. Returns the
    /// number of newly stored events.
    pub async fn import(
        &self,
        events: Vec<EventRecord>,
        cancel: &CancellationToken,
    ) -> Result<usize, SyncError> {
        self.ensure_ready()?;
        let mut batch = events;
        batch.sort_by(|a, b| {
            a.lamport_clock
                .cmp(&b.lamport_clock)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });

        let mut inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // Deduplicate against the store and within the batch itself
        let mut by_session: HashMap<SessionId, Vec<String>> = HashMap::new();
        for event in &batch {
            by_session
                .entry(event.session_id)
                .or_default()
                .push(event.event_id.clone());
        }
        let mut existing: HashSet<(SessionId, String)> = HashSet::new();
        for (session_id, ids) in &by_session {
            for id in self.store.lookup_existing_ids(*session_id, ids).await? {
                existing.insert((*session_id, id));
            }
        }

        let mut fresh: Vec<EventRecord> = Vec::new();
        let mut seen: HashSet<(SessionId, String)> = HashSet::new();
        for mut event in batch {
            let key = (event.session_id, event.event_id.clone());
            if existing.contains(&key) || !seen.insert(key) {
                continue;
            }
            // Content-address integrity: recompute before anything persists
            codec::verify_event_id(&event)?;
            event.is_imported = true;
            fresh.push(event);
        }

        if fresh.is_empty() {
            return Ok(0);
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // One transaction: either every new event lands or none do
        self.store.append_all(&fresh).await?;

        for event in &fresh {
            let merged = inner
                .session_clocks
                .entry(event.session_id)
                .or_default()
                .merge(&event.vector_clock);
            inner.session_clocks.insert(event.session_id, merged);
            inner.global_lamport = inner.global_lamport.max(event.lamport_clock);
        }
        debug!(imported = fresh.len(), "imported remote events");
        Ok(fresh.len())
    }

    /// All events for a session in canonical order
    pub async fn get_events(&self, session_id: SessionId) -> Result<Vec<EventRecord>, SyncError> {
        self.ensure_ready()?;
        self.store.list(session_id).await
    }

    /// Events the caller doesn't already know, canonical order
    pub async fn get_missing_events(
        &self,
        session_id: SessionId,
        known_ids: &HashSet<String>,
    ) -> Result<Vec<EventRecord>, SyncError> {
        self.ensure_ready()?;
        self.store.list_missing(session_id, known_ids).await
    }

    /// Current DAG tips for a session
    pub async fn get_head_event_ids(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<String>, SyncError> {
        self.ensure_ready()?;
        self.store.heads(session_id).await
    }

    /// Materialize the session's converged state
    pub async fn get_session_state(
        &self,
        session_id: SessionId,
    ) -> Result<SessionState, SyncError> {
        self.ensure_ready()?;
        let events = self.store.list(session_id).await?;
        Ok(materialize(events))
    }
}
