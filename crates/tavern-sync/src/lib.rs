//! Tavern replication layer
//!
//! This crate provides:
//! - Durable append-only event tables (sled-backed, behind a trait)
//! - The event store: heads, ordered listings, missing-event queries
//! - Deterministic CRDT materialization of session state
//! - The sync engine facade (append-local, import-remote, read state)
//! - The gossip exchange that converges two replicas over a secure channel

pub mod engine;
pub mod error;
pub mod gossip;
pub mod materialize;
pub mod storage;
pub mod store;

pub use engine::SyncEngine;
pub use error::SyncError;
pub use gossip::{GossipError, GossipExchange, GossipMessage};
pub use materialize::materialize;
pub use storage::{EventLogEdge, EventLogEntry, EventTables, SledTables, StorageError};
pub use store::EventStore;
