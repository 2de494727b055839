//! Broker capability surface.
//!
//! The coordinator core depends on these traits, never on a concrete
//! client, so the test suite can substitute the in-memory broker.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// One delivered stream entry
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    #[must_use]
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self { id: id.into(), fields }
    }
}

/// XPENDING-style summary for a consumer group
#[derive(Debug, Clone, Default)]
pub struct PendingSummary {
    pub total: u64,
    pub min_id: Option<String>,
    pub max_id: Option<String>,
    /// Pending count per consumer name
    pub consumers: HashMap<String, u64>,
}

/// One pending entry with delivery bookkeeping
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Atomic key-value operations backing leader election
#[async_trait]
pub trait KvStore: Send + Sync {
    /// SET-if-absent with TTL. Returns true when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Atomically extend the TTL only when the stored value equals `value`.
    async fn renew_if_owned(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Atomically delete only when the stored value equals `value`.
    async fn release_if_owned(&self, key: &str, value: &str) -> Result<bool>;

    /// Drop any pooled client handles during shutdown. No-op by default.
    async fn disconnect(&self) {}
}

/// Consumer-group stream operations
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Create a consumer group. Already-exists is not an error.
    async fn create_group(&self, stream: &str, group: &str, start_from: &str) -> Result<()>;

    /// Blocking group read of up to `count` new entries for `consumer`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>>;

    /// Acknowledge one entry for the group.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Append an entry, returning its id.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String>;

    /// Append with an approximate length cap.
    async fn append_capped(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: usize,
    ) -> Result<String>;

    /// Pending-entries summary for the group.
    async fn pending_summary(&self, stream: &str, group: &str) -> Result<PendingSummary>;

    /// Pending entries in `[from, to]`, optionally filtered to one consumer.
    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        from: &str,
        to: &str,
        limit: usize,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>>;

    /// Claim pending entries idle for at least `min_idle` to `new_consumer`.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>>;
}

/// Full broker capability set
pub trait Broker: KvStore + StreamBus {}

impl<T: KvStore + StreamBus> Broker for T {}
