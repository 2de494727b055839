//! Active trading-pair tracking fed by swap, volume and price streams.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

/// One pair seen recently on an analytics stream
#[derive(Debug, Clone, Serialize)]
pub struct ActivePair {
    pub last_seen_ms: i64,
    pub chain: String,
    pub dex: String,
}

/// TTL-bounded registry of recently active pairs
pub struct ActivePairTracker {
    pairs: DashMap<String, ActivePair>,
    ttl: Duration,
}

impl ActivePairTracker {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            pairs: DashMap::new(),
            ttl,
        }
    }

    /// Record activity for a pair, refreshing its last-seen timestamp
    pub fn touch(&self, pair: &str, chain: &str, dex: &str) {
        self.pairs.insert(
            pair.to_string(),
            ActivePair {
                last_seen_ms: Utc::now().timestamp_millis(),
                chain: chain.to_string(),
                dex: dex.to_string(),
            },
        );
    }

    /// Drop pairs not seen within the TTL. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let horizon = Utc::now().timestamp_millis() - self.ttl.as_millis() as i64;
        let before = self.pairs.len();
        self.pairs.retain(|_, pair| pair.last_seen_ms >= horizon);
        before - self.pairs.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Copy of tracked pairs for the HTTP surface
    #[must_use]
    pub fn snapshot(&self) -> std::collections::HashMap<String, ActivePair> {
        self.pairs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.pairs.clear();
    }
}
