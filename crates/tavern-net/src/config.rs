//! Channel configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the secure channel and its surrounding peer bookkeeping
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// How long a sender waits for an ack before the send fails
    pub ack_timeout: Duration,
    /// Cadence of discovery announcements (consumed by the transport layer)
    pub discovery_broadcast_interval: Duration,
    /// Descriptors older than this are considered gone
    pub peer_expiry: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            discovery_broadcast_interval: Duration::from_secs(3),
            peer_expiry: Duration::from_secs(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.discovery_broadcast_interval, Duration::from_secs(3));
        assert_eq!(config.peer_expiry, Duration::from_secs(20));
    }
}
