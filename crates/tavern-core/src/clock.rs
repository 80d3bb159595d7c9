//! Vector clocks keyed by peer id
//!
//! Comparison and canonicalization are byte-ordinal throughout so that
//! every replica derives identical canonical strings and event ids.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Map from peer id to a monotone counter.
///
/// Absent peers read as 0. All mutating operations are pure: they return a
/// new clock and leave `self` untouched, which keeps cached clocks safe to
/// hand out by value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Empty clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a peer, 0 when absent
    pub fn get(&self, peer_id: &str) -> u64 {
        self.entries.get(peer_id).copied().unwrap_or(0)
    }

    /// Return a new clock with `peer_id`'s counter incremented by one
    pub fn increment(&self, peer_id: &str) -> Self {
        let mut entries = self.entries.clone();
        *entries.entry(peer_id.to_string()).or_insert(0) += 1;
        Self { entries }
    }

    /// Return the pointwise maximum of `self` and `other`
    pub fn merge(&self, other: &Self) -> Self {
        let mut entries = self.entries.clone();
        for (peer, counter) in &other.entries {
            let slot = entries.entry(peer.clone()).or_insert(0);
            if *counter > *slot {
                *slot = *counter;
            }
        }
        Self { entries }
    }

    /// True when every entry of `other` is <= the matching entry here
    pub fn dominates(&self, other: &Self) -> bool {
        other
            .entries
            .iter()
            .all(|(peer, counter)| self.get(peer) >= *counter)
    }

    /// Deterministic string form: entries sorted by peer id (byte-ordinal),
    /// joined as `peer:value|peer:value`. Feeds the event-id hash, so it must
    /// be identical across implementations.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (i, (peer, counter)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push('|');
            }
            out.push_str(peer);
            out.push(':');
            out.push_str(&counter.to_string());
        }
        out
    }

    /// JSON object form, as persisted in the `vector_clock` column
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse the JSON object form
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Number of peers with a nonzero entry
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no peer has been recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_peer_reads_zero() {
        let clock = VectorClock::new();
        assert_eq!(clock.get("peer-a"), 0);
    }

    #[test]
    fn test_increment_is_pure() {
        let a = VectorClock::new();
        let b = a.increment("peer-a");
        assert_eq!(a.get("peer-a"), 0);
        assert_eq!(b.get("peer-a"), 1);
        assert_eq!(b.increment("peer-a").get("peer-a"), 2);
    }

    #[test]
    fn test_merge_pointwise_max() {
        let a = VectorClock::new().increment("a").increment("a").increment("b");
        let b = VectorClock::new().increment("a").increment("c");
        let merged = a.merge(&b);
        assert_eq!(merged.get("a"), 2);
        assert_eq!(merged.get("b"), 1);
        assert_eq!(merged.get("c"), 1);
        // Commutative
        assert_eq!(merged, b.merge(&a));
    }

    #[test]
    fn test_canonical_sorted_by_peer() {
        let clock = VectorClock::new()
            .increment("zeta")
            .increment("alpha")
            .increment("alpha");
        assert_eq!(clock.canonical(), "alpha:2|zeta:1");
        assert_eq!(VectorClock::new().canonical(), "");
    }

    #[test]
    fn test_json_roundtrip() {
        let clock = VectorClock::new().increment("a").increment("b");
        let json = clock.to_json();
        let parsed = VectorClock::from_json(&json).unwrap();
        assert_eq!(clock, parsed);
    }

    #[test]
    fn test_dominates() {
        let a = VectorClock::new().increment("a").increment("a");
        let b = VectorClock::new().increment("a");
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(a.dominates(&VectorClock::new()));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn clock_strategy() -> impl Strategy<Value = VectorClock> {
            proptest::collection::btree_map("[a-z]{1,4}", 1u64..100, 0..6)
                .prop_map(|map| map.into_iter().collect())
        }

        proptest! {
            #[test]
            fn prop_merge_commutative(a in clock_strategy(), b in clock_strategy()) {
                prop_assert_eq!(a.merge(&b), b.merge(&a));
            }

            #[test]
            fn prop_merge_idempotent(a in clock_strategy()) {
                prop_assert_eq!(a.merge(&a), a);
            }

            #[test]
            fn prop_merge_dominates_both(a in clock_strategy(), b in clock_strategy()) {
                let merged = a.merge(&b);
                prop_assert!(merged.dominates(&a));
                prop_assert!(merged.dominates(&b));
            }

            #[test]
            fn prop_canonical_json_roundtrip(a in clock_strategy()) {
                let parsed = VectorClock::from_json(&a.to_json()).unwrap();
                prop_assert_eq!(parsed.canonical(), a.canonical());
                prop_assert_eq!(parsed, a);
            }
        }
    }
}
