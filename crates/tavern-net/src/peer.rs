//! Peer descriptors
//!
//! Discovery itself lives outside the core; the channel layer consumes the
//! descriptors it produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A peer as announced by the discovery layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub peer_id: String,
    pub device_name: String,
    /// Base64 Ed25519 identity public key
    pub identity_public_key: String,
    /// Base64 persistent X25519 public key
    pub key_exchange_public_key: String,
    pub host: String,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
}

impl PeerDescriptor {
    /// Refresh the last-seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// True once the descriptor has outlived the expiry window
    pub fn is_expired(&self, expiry: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_seen);
        age.to_std().map(|age| age > expiry).unwrap_or(false)
    }
}
