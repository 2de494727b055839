//! In-memory broker used by the test suite and local experiments.
//!
//! Emulates the subset of broker behavior the coordinator depends on:
//! TTL'd keys, consumer groups with a pending-entries list, claims and
//! capped appends. Test hooks allow seeding pre-aged pending entries and
//! injecting append failures.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{KvStore, PendingEntry, PendingSummary, StreamBus, StreamMessage};
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct KvEntry {
    value: String,
    expires_at: Instant,
}

struct PelEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct GroupState {
    /// Index into `StreamState::entries` of the next undelivered entry
    cursor: usize,
    pel: HashMap<String, PelEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(String, HashMap<String, String>)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, KvEntry>,
    streams: HashMap<String, StreamState>,
    next_seq: u64,
}

impl Inner {
    fn next_id(&mut self) -> String {
        self.next_seq += 1;
        // Zero-padded so lexicographic order matches insertion order
        format!("{:016}-0", self.next_seq)
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    fail_appends: AtomicBool,
    fail_kv: AtomicBool,
    kv_ops: AtomicU64,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `append`/`append_capped` fail with `BrokerUnavailable`
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make every KV operation fail with `BrokerUnavailable`
    pub fn set_fail_kv(&self, fail: bool) {
        self.fail_kv.store(fail, Ordering::SeqCst);
    }

    /// Current (non-expired) KV value
    #[must_use]
    pub fn kv_get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner.kv.get(key).and_then(|e| {
            if e.expires_at > Instant::now() {
                Some(e.value.clone())
            } else {
                None
            }
        })
    }

    /// All entries ever appended to a stream, oldest first
    #[must_use]
    pub fn stream_entries(&self, stream: &str) -> Vec<StreamMessage> {
        let inner = self.inner.lock();
        inner
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamMessage::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stream_len(&self, stream: &str) -> usize {
        let inner = self.inner.lock();
        inner.streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// Append an entry and record it as pending for `consumer`, already
    /// idle for `idle`. The group's cursor is advanced past the entry so
    /// only claims (not reads) can surface it again.
    pub fn seed_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        fields: HashMap<String, String>,
        idle: Duration,
    ) -> String {
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.entries.push((id.clone(), fields));
        let cursor = state.entries.len();
        let group_state = state.groups.entry(group.to_string()).or_default();
        group_state.cursor = cursor;
        group_state.pel.insert(
            id.clone(),
            PelEntry {
                consumer: consumer.to_string(),
                delivered_at: Instant::now() - idle,
                delivery_count: 1,
            },
        );
        id
    }

    /// Ids currently pending for the group
    #[must_use]
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pel.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of KV operations attempted (including injected failures)
    #[must_use]
    pub fn kv_op_count(&self) -> u64 {
        self.kv_ops.load(Ordering::SeqCst)
    }

    fn check_kv_fault(&self) -> Result<()> {
        self.kv_ops.fetch_add(1, Ordering::SeqCst);
        if self.fail_kv.load(Ordering::SeqCst) {
            return Err(Error::BrokerUnavailable("kv fault injected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryBroker {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_kv_fault()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let live = inner
            .kv
            .get(key)
            .is_some_and(|entry| entry.expires_at > now);
        if live {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew_if_owned(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_kv_fault()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.kv.get_mut(key) {
            Some(entry) if entry.expires_at > now && entry.value == value => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_if_owned(&self, key: &str, value: &str) -> Result<bool> {
        self.check_kv_fault()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let owned = inner
            .kv
            .get(key)
            .is_some_and(|entry| entry.expires_at > now && entry.value == value);
        if owned {
            inner.kv.remove(key);
        }
        Ok(owned)
    }
}

#[async_trait]
impl StreamBus for MemoryBroker {
    async fn create_group(&self, stream: &str, group: &str, _start_from: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.streams.entry(stream.to_string()).or_default();
        // Mirrors XGROUP CREATE with MKSTREAM and a "$" start: existing
        // entries are not redelivered to a new group
        let cursor = state.entries.len();
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState { cursor, pel: HashMap::new() });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(state) = inner.streams.get_mut(stream) {
                    let Some(group_state) = state.groups.get_mut(group) else {
                        return Err(Error::BrokerProtocol(format!(
                            "NOGROUP no such group '{group}' for stream '{stream}'"
                        )));
                    };
                    if group_state.cursor < state.entries.len() {
                        let end = (group_state.cursor + count).min(state.entries.len());
                        let mut batch = Vec::with_capacity(end - group_state.cursor);
                        for (id, fields) in &state.entries[group_state.cursor..end] {
                            group_state.pel.insert(
                                id.clone(),
                                PelEntry {
                                    consumer: consumer.to_string(),
                                    delivered_at: Instant::now(),
                                    delivery_count: 1,
                                },
                            );
                            batch.push(StreamMessage::new(id.clone(), fields.clone()));
                        }
                        group_state.cursor = end;
                        return Ok(batch);
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(block)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(group_state) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group_state.pel.remove(id);
        }
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::BrokerUnavailable("append fault injected".to_string()));
        }
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        let state = inner.streams.entry(stream.to_string()).or_default();
        state
            .entries
            .push((id.clone(), fields.iter().cloned().collect()));
        Ok(id)
    }

    async fn append_capped(
        &self,
        stream: &str,
        fields: &[(String, String)],
        _max_len: usize,
    ) -> Result<String> {
        // The cap is approximate in Redis; the emulation keeps everything
        self.append(stream, fields).await
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> Result<PendingSummary> {
        let inner = self.inner.lock();
        let Some(group_state) = inner.streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Ok(PendingSummary::default());
        };

        let mut summary = PendingSummary {
            total: group_state.pel.len() as u64,
            ..PendingSummary::default()
        };
        let mut ids: Vec<&String> = group_state.pel.keys().collect();
        ids.sort();
        summary.min_id = ids.first().map(|s| (*s).clone());
        summary.max_id = ids.last().map(|s| (*s).clone());
        for entry in group_state.pel.values() {
            *summary.consumers.entry(entry.consumer.clone()).or_insert(0) += 1;
        }
        Ok(summary)
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        _from: &str,
        _to: &str,
        limit: usize,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>> {
        let inner = self.inner.lock();
        let Some(group_state) = inner.streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut entries: Vec<PendingEntry> = group_state
            .pel
            .iter()
            .filter(|(_, e)| consumer.is_none_or(|c| e.consumer == c))
            .map(|(id, e)| PendingEntry {
                id: id.clone(),
                consumer: e.consumer.clone(),
                idle: now.saturating_duration_since(e.delivered_at),
                delivery_count: e.delivery_count,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let entry_fields: HashMap<String, HashMap<String, String>> = state
            .entries
            .iter()
            .map(|(id, fields)| (id.clone(), fields.clone()))
            .collect();
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for id in ids {
            if let Some(pel) = group_state.pel.get_mut(id) {
                let idle = now.saturating_duration_since(pel.delivered_at);
                if idle >= min_idle {
                    pel.consumer = new_consumer.to_string();
                    pel.delivered_at = now;
                    pel.delivery_count += 1;
                    if let Some(fields) = entry_fields.get(id) {
                        claimed.push(StreamMessage::new(id.clone(), fields.clone()));
                    }
                }
            }
        }
        Ok(claimed)
    }
}
