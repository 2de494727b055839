//! Opportunity store and leader-gated forwarding.

use chrono::Utc;
use dashmap::DashMap;
use failsafe::CircuitBreaker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use arbcoord_core::metrics::SystemMetrics;
use arbcoord_core::resilience::circuit_breaker::{self, ExecutionBreaker};

use super::opportunity::{Opportunity, OpportunityStatus};
use crate::alerts::{AlertKind, AlertManager, AlertSeverity};
use crate::broker::{Broker, StreamBus};
use crate::election::LeadershipView;
use crate::ingest::Envelope;

/// Arrivals for a known id within this window are duplicates
const DUPLICATE_WINDOW_MS: i64 = 5000;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_opportunities: usize,
    pub opportunity_ttl: Duration,
    pub execution_stream: String,
    pub breaker_threshold: u32,
    pub breaker_reset: Duration,
}

/// What happened to one arriving opportunity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored; `forwarded` is true when the execution request went out
    Stored { forwarded: bool },
    MissingId,
    Duplicate,
    ProfitOutOfRange,
}

pub struct OpportunityRouter {
    opportunities: DashMap<String, Opportunity>,
    config: RouterConfig,
    broker: Arc<dyn Broker>,
    leadership: Arc<dyn LeadershipView>,
    breaker: ExecutionBreaker,
    /// Collapses open-transition alerts to one per open period
    open_alerted: AtomicBool,
    alerts: Arc<AlertManager>,
    metrics: Arc<SystemMetrics>,
    instance_id: String,
}

impl OpportunityRouter {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        leadership: Arc<dyn LeadershipView>,
        alerts: Arc<AlertManager>,
        metrics: Arc<SystemMetrics>,
        instance_id: String,
        config: RouterConfig,
    ) -> Self {
        let breaker = circuit_breaker::create(config.breaker_threshold, config.breaker_reset);
        Self {
            opportunities: DashMap::new(),
            config,
            broker,
            leadership,
            breaker,
            open_alerted: AtomicBool::new(false),
            alerts,
            metrics,
            instance_id,
        }
    }

    /// Triage one opportunity envelope: validate, dedup, store and, on the
    /// leader, forward to the execution stream.
    pub async fn ingest(&self, envelope: &Envelope) -> IngestOutcome {
        self.metrics.incr_opportunities_seen();

        let Some(opportunity) = Opportunity::from_envelope(envelope) else {
            debug!("Dropping opportunity without an id");
            return IngestOutcome::MissingId;
        };

        if let Some(existing) = self.opportunities.get(&opportunity.id) {
            if (existing.timestamp_ms - opportunity.timestamp_ms).abs() < DUPLICATE_WINDOW_MS {
                debug!(
                    opportunity_id = %opportunity.id,
                    "Dropping duplicate opportunity"
                );
                return IngestOutcome::Duplicate;
            }
        }

        if !opportunity.profit_in_range() {
            debug!(
                opportunity_id = %opportunity.id,
                profit_percentage = ?opportunity.profit_percentage,
                "Dropping opportunity with out-of-range profit"
            );
            return IngestOutcome::ProfitOutOfRange;
        }

        let id = opportunity.id.clone();
        let should_forward =
            self.leadership.is_leader() && opportunity.status == OpportunityStatus::Pending;
        self.opportunities.insert(id.clone(), opportunity);

        let forwarded = if should_forward {
            self.forward(&id).await
        } else {
            false
        };

        IngestOutcome::Stored { forwarded }
    }

    /// Forward a stored opportunity behind the circuit breaker.
    async fn forward(&self, id: &str) -> bool {
        if !self.breaker.is_call_permitted() {
            debug!(opportunity_id = %id, "Execution circuit open, skipping forward");
            return false;
        }

        let Some(opportunity) = self.opportunities.get(id).map(|o| o.clone()) else {
            return false;
        };

        let fields =
            opportunity.to_execution_fields(&self.instance_id, Utc::now().timestamp_millis());

        match self.broker.append(&self.config.execution_stream, &fields).await {
            Ok(entry_id) => {
                self.breaker.on_success();
                self.open_alerted.store(false, Ordering::SeqCst);
                self.metrics.incr_executions_forwarded();
                if let Some(mut stored) = self.opportunities.get_mut(id) {
                    stored.status = OpportunityStatus::Forwarded;
                }
                debug!(
                    opportunity_id = %id,
                    entry_id = %entry_id,
                    "Forwarded execution request"
                );
                true
            }
            Err(e) => {
                self.breaker.on_error();
                warn!(
                    opportunity_id = %id,
                    error = %e,
                    "Failed to forward execution request"
                );
                if !self.breaker.is_call_permitted()
                    && !self.open_alerted.swap(true, Ordering::SeqCst)
                {
                    self.alerts.send(
                        AlertKind::ExecutionCircuitOpen,
                        AlertSeverity::Critical,
                        None,
                        "Execution stream circuit opened",
                        serde_json::json!({
                            "stream": self.config.execution_stream,
                            "threshold": self.config.breaker_threshold,
                        }),
                    );
                }
                false
            }
        }
    }

    /// Record an execution outcome for a stored opportunity. The record
    /// may already have been collected by TTL; that is not an error.
    pub fn record_result(&self, id: &str, success: bool) {
        if let Some(mut stored) = self.opportunities.get_mut(id) {
            stored.status = if success {
                OpportunityStatus::Completed
            } else {
                OpportunityStatus::Failed
            };
        }
    }

    /// Periodic cleanup in two phases: collect expired ids, then delete;
    /// finally evict oldest entries past the size bound. The phase split
    /// keeps the pass safe against concurrent inserts. The per-message
    /// path never cleans up.
    pub fn cleanup(&self) -> (usize, usize) {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = self.config.opportunity_ttl.as_millis() as i64;

        let expired: Vec<String> = self
            .opportunities
            .iter()
            .filter(|entry| entry.value().is_expired(now, ttl_ms))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.opportunities.remove(id);
        }

        let mut evicted = 0usize;
        let len = self.opportunities.len();
        if len > self.config.max_opportunities {
            let excess = len - self.config.max_opportunities;
            let mut by_age: Vec<(i64, String)> = self
                .opportunities
                .iter()
                .map(|entry| (entry.value().timestamp_ms, entry.key().clone()))
                .collect();
            // Oldest first; id order breaks timestamp ties deterministically
            by_age.sort();
            for (_, id) in by_age.into_iter().take(excess) {
                self.opportunities.remove(&id);
                evicted += 1;
            }
        }

        if !expired.is_empty() || evicted > 0 {
            debug!(
                expired = expired.len(),
                evicted = evicted,
                remaining = self.opportunities.len(),
                "Opportunity cleanup pass complete"
            );
        }
        self.metrics
            .set_pending_opportunities(self.opportunities.len() as u64);

        (expired.len(), evicted)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.opportunities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.opportunities.is_empty()
    }

    /// Copy of every stored record for the HTTP surface
    #[must_use]
    pub fn snapshot(&self) -> Vec<Opportunity> {
        self.opportunities
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.opportunities.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingNotifier;
    use crate::broker::{MemoryBroker, StreamMessage};
    use std::collections::HashMap;

    struct FixedLeadership(bool);

    impl LeadershipView for FixedLeadership {
        fn is_leader(&self) -> bool {
            self.0
        }
    }

    fn envelope(pairs: &[(&str, &str)]) -> Envelope {
        let fields: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Envelope::normalize(&StreamMessage::new("1-0", fields))
    }

    fn router_with(
        broker: Arc<MemoryBroker>,
        leader: bool,
        threshold: u32,
        max_opportunities: usize,
    ) -> (OpportunityRouter, Arc<RecordingNotifier>) {
        let recorder = Arc::new(RecordingNotifier::new());
        let alerts = Arc::new(AlertManager::new(recorder.clone(), Duration::from_secs(300)));
        let router = OpportunityRouter::new(
            broker,
            Arc::new(FixedLeadership(leader)),
            alerts,
            Arc::new(SystemMetrics::new()),
            "coord-a".to_string(),
            RouterConfig {
                max_opportunities,
                opportunity_ttl: Duration::from_secs(60),
                execution_stream: "stream:execution-requests".to_string(),
                breaker_threshold: threshold,
                breaker_reset: Duration::from_secs(60),
            },
        );
        (router, recorder)
    }

    #[tokio::test]
    async fn test_leader_forwards_pending_opportunities() {
        let broker = Arc::new(MemoryBroker::new());
        let (router, _) = router_with(broker.clone(), true, 5, 1000);

        let outcome = router
            .ingest(&envelope(&[("id", "opp-1"), ("confidence", "0.9")]))
            .await;
        assert_eq!(outcome, IngestOutcome::Stored { forwarded: true });
        assert_eq!(broker.stream_len("stream:execution-requests"), 1);
    }

    #[tokio::test]
    async fn test_follower_stores_without_forwarding() {
        let broker = Arc::new(MemoryBroker::new());
        let (router, _) = router_with(broker.clone(), false, 5, 1000);

        let outcome = router.ingest(&envelope(&[("id", "opp-1")])).await;
        assert_eq!(outcome, IngestOutcome::Stored { forwarded: false });
        assert_eq!(router.len(), 1);
        assert_eq!(broker.stream_len("stream:execution-requests"), 0);
    }

    #[tokio::test]
    async fn test_non_pending_status_is_not_forwarded() {
        let broker = Arc::new(MemoryBroker::new());
        let (router, _) = router_with(broker.clone(), true, 5, 1000);

        let outcome = router
            .ingest(&envelope(&[("id", "opp-1"), ("status", "forwarded")]))
            .await;
        assert_eq!(outcome, IngestOutcome::Stored { forwarded: false });
        assert_eq!(broker.stream_len("stream:execution-requests"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_window_dedup() {
        let broker = Arc::new(MemoryBroker::new());
        let (router, _) = router_with(broker.clone(), true, 5, 1000);

        let first = router
            .ingest(&envelope(&[("id", "X"), ("timestamp", "1000")]))
            .await;
        let second = router
            .ingest(&envelope(&[("id", "X"), ("timestamp", "2000")]))
            .await;
        let third = router
            .ingest(&envelope(&[("id", "X"), ("timestamp", "10000")]))
            .await;

        assert_eq!(first, IngestOutcome::Stored { forwarded: true });
        assert_eq!(second, IngestOutcome::Duplicate);
        assert_eq!(third, IngestOutcome::Stored { forwarded: true });
        assert_eq!(router.len(), 1);
        assert_eq!(broker.stream_len("stream:execution-requests"), 2);
    }

    #[tokio::test]
    async fn test_profit_range_gate() {
        let broker = Arc::new(MemoryBroker::new());
        let (router, _) = router_with(broker.clone(), true, 5, 1000);

        let rejected = router
            .ingest(&envelope(&[("id", "p1"), ("profitPercentage", "10000.0001")]))
            .await;
        assert_eq!(rejected, IngestOutcome::ProfitOutOfRange);
        assert!(router.is_empty());

        let accepted = router
            .ingest(&envelope(&[("id", "p2"), ("profitPercentage", "-100")]))
            .await;
        assert_eq!(accepted, IngestOutcome::Stored { forwarded: true });
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_and_alerts_once() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_fail_appends(true);
        let (router, recorder) = router_with(broker.clone(), true, 3, 1000);

        for i in 0..5 {
            let ts = (1_000_000 + i * 10_000).to_string();
            router
                .ingest(&envelope(&[("id", &format!("opp-{i}")), ("timestamp", &ts)]))
                .await;
        }
        tokio::task::yield_now().await;

        // Three attempts reached the broker, then the circuit opened
        assert_eq!(broker.stream_len("stream:execution-requests"), 0);
        assert_eq!(recorder.count_of(AlertKind::ExecutionCircuitOpen), 1);
        // All five were stored regardless of forwarding
        assert_eq!(router.len(), 5);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_and_evicts_oldest() {
        let broker = Arc::new(MemoryBroker::new());
        let (router, _) = router_with(broker.clone(), false, 5, 3);
        let now = Utc::now().timestamp_millis();

        // One expired by TTL, four fresh (one over the size bound)
        router
            .ingest(&envelope(&[
                ("id", "stale"),
                ("timestamp", &(now - 120_000).to_string()),
            ]))
            .await;
        for (i, age) in [4000i64, 3000, 2000, 1000].iter().enumerate() {
            router
                .ingest(&envelope(&[
                    ("id", &format!("fresh-{i}")),
                    ("timestamp", &(now - age).to_string()),
                ]))
                .await;
        }

        let (expired, evicted) = router.cleanup();
        assert_eq!(expired, 1);
        assert_eq!(evicted, 1);
        assert_eq!(router.len(), 3);
        // The oldest fresh entry was the eviction victim
        assert!(!router.snapshot().iter().any(|o| o.id == "fresh-0"));
    }

    #[tokio::test]
    async fn test_cleanup_eviction_tiebreak_is_lexicographic() {
        let broker = Arc::new(MemoryBroker::new());
        let (router, _) = router_with(broker.clone(), false, 5, 2);
        let now = Utc::now().timestamp_millis();
        let ts = (now - 1000).to_string();

        for id in ["b", "a", "c"] {
            router
                .ingest(&envelope(&[("id", id), ("timestamp", &ts)]))
                .await;
        }

        let (_, evicted) = router.cleanup();
        assert_eq!(evicted, 1);
        let remaining: Vec<String> = router.snapshot().iter().map(|o| o.id.clone()).collect();
        assert!(!remaining.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_cleanup_with_exactly_one_excess_removes_one() {
        let broker = Arc::new(MemoryBroker::new());
        let (router, _) = router_with(broker.clone(), false, 5, 4);
        let now = Utc::now().timestamp_millis();

        for i in 0..5 {
            router
                .ingest(&envelope(&[
                    ("id", &format!("opp-{i}")),
                    ("timestamp", &(now - 1000 - i as i64).to_string()),
                ]))
                .await;
        }

        let (expired, evicted) = router.cleanup();
        assert_eq!(expired, 0);
        assert_eq!(evicted, 1);
        assert_eq!(router.len(), 4);
    }

    #[tokio::test]
    async fn test_record_result_updates_status() {
        let broker = Arc::new(MemoryBroker::new());
        let (router, _) = router_with(broker.clone(), false, 5, 1000);

        router.ingest(&envelope(&[("id", "opp-1")])).await;
        router.record_result("opp-1", true);
        assert_eq!(
            router.snapshot()[0].status,
            OpportunityStatus::Completed
        );

        // Unknown ids are tolerated (TTL may have collected the record)
        router.record_result("gone", false);
    }
}
