//! Prometheus metrics and the in-process metrics snapshot.
//!
//! Collectors are registered on a dedicated registry and exposed via the
//! `/metrics` endpoint. `SystemMetrics` keeps the same figures as plain
//! atomics so the coordinator can embed a snapshot in its health
//! self-report and the `/status` payload without scraping itself.

use parking_lot::Mutex;
use prometheus::{
    register_gauge_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Gauge,
    IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Coordinator counters and gauges
pub mod coordinator {
    use super::{
        register_gauge_with_registry, register_int_counter_vec_with_registry,
        register_int_counter_with_registry, register_int_gauge_with_registry, Gauge, IntCounter,
        IntCounterVec, IntGauge, Opts, REGISTRY,
    };

    pub static OPPORTUNITIES_SEEN: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "coordinator_opportunities_seen_total",
            "Total opportunities received from the opportunities stream",
            REGISTRY.clone()
        )
        .expect("Failed to register OPPORTUNITIES_SEEN")
    });

    pub static EXECUTIONS_FORWARDED: std::sync::LazyLock<IntCounter> =
        std::sync::LazyLock::new(|| {
            register_int_counter_with_registry!(
                "coordinator_executions_forwarded_total",
                "Total execution requests appended to the execution stream",
                REGISTRY.clone()
            )
            .expect("Failed to register EXECUTIONS_FORWARDED")
        });

    pub static EXECUTIONS_SUCCEEDED: std::sync::LazyLock<IntCounter> =
        std::sync::LazyLock::new(|| {
            register_int_counter_with_registry!(
                "coordinator_executions_succeeded_total",
                "Total successful execution results",
                REGISTRY.clone()
            )
            .expect("Failed to register EXECUTIONS_SUCCEEDED")
        });

    pub static TOTAL_PROFIT_USD: std::sync::LazyLock<Gauge> = std::sync::LazyLock::new(|| {
        register_gauge_with_registry!(
            "coordinator_total_profit_usd",
            "Cumulative realized profit in USD",
            REGISTRY.clone()
        )
        .expect("Failed to register TOTAL_PROFIT_USD")
    });

    pub static SWAP_EVENTS: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "coordinator_swap_events_total",
            "Total swap events processed",
            REGISTRY.clone()
        )
        .expect("Failed to register SWAP_EVENTS")
    });

    pub static VOLUME_USD: std::sync::LazyLock<Gauge> = std::sync::LazyLock::new(|| {
        register_gauge_with_registry!(
            "coordinator_volume_usd_total",
            "Cumulative swap volume in USD",
            REGISTRY.clone()
        )
        .expect("Failed to register VOLUME_USD")
    });

    pub static AGGREGATES_PROCESSED: std::sync::LazyLock<IntCounter> =
        std::sync::LazyLock::new(|| {
            register_int_counter_with_registry!(
                "coordinator_aggregates_processed_total",
                "Total volume aggregates processed",
                REGISTRY.clone()
            )
            .expect("Failed to register AGGREGATES_PROCESSED")
        });

    pub static PRICE_UPDATES: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "coordinator_price_updates_total",
            "Total price updates processed",
            REGISTRY.clone()
        )
        .expect("Failed to register PRICE_UPDATES")
    });

    pub static WHALE_ALERTS: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "coordinator_whale_alerts_total",
            "Total whale alerts processed",
            REGISTRY.clone()
        )
        .expect("Failed to register WHALE_ALERTS")
    });

    pub static STREAM_RECOVERIES: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "coordinator_stream_recoveries_total",
            "Total orphaned pending messages recovered",
            REGISTRY.clone()
        )
        .expect("Failed to register STREAM_RECOVERIES")
    });

    pub static STALE_LOCK_RECOVERIES: std::sync::LazyLock<IntCounter> =
        std::sync::LazyLock::new(|| {
            register_int_counter_with_registry!(
                "coordinator_stale_lock_recoveries_total",
                "Total leader locks re-adopted after a restart within the lock TTL",
                REGISTRY.clone()
            )
            .expect("Failed to register STALE_LOCK_RECOVERIES")
        });

    pub static DLQ_WRITES: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "coordinator_dlq_writes_total",
            "Total envelopes written to the dead-letter queue",
            REGISTRY.clone()
        )
        .expect("Failed to register DLQ_WRITES")
    });

    pub static RATE_LIMITED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "coordinator_rate_limited_total",
            "Total stream messages dropped by the rate limiter",
            REGISTRY.clone()
        )
        .expect("Failed to register RATE_LIMITED")
    });

    pub static STREAM_ERRORS: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "coordinator_stream_errors_total",
            "Total stream reader-path errors",
            REGISTRY.clone()
        )
        .expect("Failed to register STREAM_ERRORS")
    });

    pub static ALERTS_SENT: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            Opts::new("coordinator_alerts_sent_total", "Total alerts dispatched"),
            &["kind", "severity"],
            REGISTRY.clone()
        )
        .expect("Failed to register ALERTS_SENT")
    });

    pub static SYSTEM_HEALTH_PERCENT: std::sync::LazyLock<Gauge> = std::sync::LazyLock::new(|| {
        register_gauge_with_registry!(
            "coordinator_system_health_percent",
            "Share of tracked services currently healthy",
            REGISTRY.clone()
        )
        .expect("Failed to register SYSTEM_HEALTH_PERCENT")
    });

    pub static ACTIVE_SERVICES: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "coordinator_active_services",
            "Number of healthy services",
            REGISTRY.clone()
        )
        .expect("Failed to register ACTIVE_SERVICES")
    });

    pub static PENDING_OPPORTUNITIES: std::sync::LazyLock<IntGauge> =
        std::sync::LazyLock::new(|| {
            register_int_gauge_with_registry!(
                "coordinator_pending_opportunities",
                "Opportunities currently held in the in-memory store",
                REGISTRY.clone()
            )
            .expect("Failed to register PENDING_OPPORTUNITIES")
        });

    pub static ACTIVE_PAIRS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "coordinator_active_pairs",
            "Trading pairs seen within the pair TTL",
            REGISTRY.clone()
        )
        .expect("Failed to register ACTIVE_PAIRS")
    });

    pub static AVERAGE_LATENCY_MS: std::sync::LazyLock<Gauge> = std::sync::LazyLock::new(|| {
        register_gauge_with_registry!(
            "coordinator_average_latency_ms",
            "Average effective service latency in milliseconds",
            REGISTRY.clone()
        )
        .expect("Failed to register AVERAGE_LATENCY_MS")
    });

    pub static AVERAGE_MEMORY_BYTES: std::sync::LazyLock<Gauge> = std::sync::LazyLock::new(|| {
        register_gauge_with_registry!(
            "coordinator_average_memory_bytes",
            "Average reported service memory in bytes",
            REGISTRY.clone()
        )
        .expect("Failed to register AVERAGE_MEMORY_BYTES")
    });

    pub static IS_LEADER: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "coordinator_is_leader",
            "1 when this instance holds the leader lock",
            REGISTRY.clone()
        )
        .expect("Failed to register IS_LEADER")
    });
}

/// Encode the registry in Prometheus text format
pub fn encode_text() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Monotonic counters and gauges mirrored into the Prometheus collectors.
///
/// The atomics are the source of truth for `snapshot()`; every increment
/// also bumps the matching collector so both views stay aligned.
#[derive(Default)]
pub struct SystemMetrics {
    opportunities_seen: AtomicU64,
    executions_forwarded: AtomicU64,
    executions_succeeded: AtomicU64,
    total_profit_usd: Mutex<f64>,
    swap_events: AtomicU64,
    volume_usd: Mutex<f64>,
    aggregates_processed: AtomicU64,
    price_updates: AtomicU64,
    whale_alerts: AtomicU64,
    stream_recoveries: AtomicU64,
    stale_lock_recoveries: AtomicU64,
    dlq_writes: AtomicU64,
    rate_limited: AtomicU64,
    stream_errors: AtomicU64,
    system_health_percent: Mutex<f64>,
    active_services: AtomicU64,
    pending_opportunities: AtomicU64,
    active_pairs: AtomicU64,
    average_latency_ms: Mutex<f64>,
    average_memory_bytes: Mutex<f64>,
}

impl SystemMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_opportunities_seen(&self) {
        self.opportunities_seen.fetch_add(1, Ordering::Relaxed);
        coordinator::OPPORTUNITIES_SEEN.inc();
    }

    pub fn incr_executions_forwarded(&self) {
        self.executions_forwarded.fetch_add(1, Ordering::Relaxed);
        coordinator::EXECUTIONS_FORWARDED.inc();
    }

    pub fn incr_executions_succeeded(&self) {
        self.executions_succeeded.fetch_add(1, Ordering::Relaxed);
        coordinator::EXECUTIONS_SUCCEEDED.inc();
    }

    pub fn add_profit_usd(&self, amount: f64) {
        *self.total_profit_usd.lock() += amount;
        coordinator::TOTAL_PROFIT_USD.add(amount);
    }

    pub fn incr_swap_events(&self) {
        self.swap_events.fetch_add(1, Ordering::Relaxed);
        coordinator::SWAP_EVENTS.inc();
    }

    pub fn add_volume_usd(&self, amount: f64) {
        *self.volume_usd.lock() += amount;
        coordinator::VOLUME_USD.add(amount);
    }

    pub fn incr_aggregates_processed(&self) {
        self.aggregates_processed.fetch_add(1, Ordering::Relaxed);
        coordinator::AGGREGATES_PROCESSED.inc();
    }

    pub fn incr_price_updates(&self) {
        self.price_updates.fetch_add(1, Ordering::Relaxed);
        coordinator::PRICE_UPDATES.inc();
    }

    pub fn incr_whale_alerts(&self) {
        self.whale_alerts.fetch_add(1, Ordering::Relaxed);
        coordinator::WHALE_ALERTS.inc();
    }

    pub fn incr_stream_recoveries(&self) {
        self.stream_recoveries.fetch_add(1, Ordering::Relaxed);
        coordinator::STREAM_RECOVERIES.inc();
    }

    pub fn incr_stale_lock_recoveries(&self) {
        self.stale_lock_recoveries.fetch_add(1, Ordering::Relaxed);
        coordinator::STALE_LOCK_RECOVERIES.inc();
    }

    pub fn incr_dlq_writes(&self) {
        self.dlq_writes.fetch_add(1, Ordering::Relaxed);
        coordinator::DLQ_WRITES.inc();
    }

    pub fn incr_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        coordinator::RATE_LIMITED.inc();
    }

    pub fn incr_stream_errors(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
        coordinator::STREAM_ERRORS.inc();
    }

    pub fn set_system_health_percent(&self, value: f64) {
        *self.system_health_percent.lock() = value;
        coordinator::SYSTEM_HEALTH_PERCENT.set(value);
    }

    pub fn set_active_services(&self, value: u64) {
        self.active_services.store(value, Ordering::Relaxed);
        coordinator::ACTIVE_SERVICES.set(value as i64);
    }

    pub fn set_pending_opportunities(&self, value: u64) {
        self.pending_opportunities.store(value, Ordering::Relaxed);
        coordinator::PENDING_OPPORTUNITIES.set(value as i64);
    }

    pub fn set_active_pairs(&self, value: u64) {
        self.active_pairs.store(value, Ordering::Relaxed);
        coordinator::ACTIVE_PAIRS.set(value as i64);
    }

    pub fn set_average_latency_ms(&self, value: f64) {
        *self.average_latency_ms.lock() = value;
        coordinator::AVERAGE_LATENCY_MS.set(value);
    }

    pub fn set_average_memory_bytes(&self, value: f64) {
        *self.average_memory_bytes.lock() = value;
        coordinator::AVERAGE_MEMORY_BYTES.set(value);
    }

    pub fn set_is_leader(&self, leader: bool) {
        coordinator::IS_LEADER.set(i64::from(leader));
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            opportunities_seen: self.opportunities_seen.load(Ordering::Relaxed),
            executions_forwarded: self.executions_forwarded.load(Ordering::Relaxed),
            executions_succeeded: self.executions_succeeded.load(Ordering::Relaxed),
            total_profit_usd: *self.total_profit_usd.lock(),
            swap_events: self.swap_events.load(Ordering::Relaxed),
            volume_usd: *self.volume_usd.lock(),
            aggregates_processed: self.aggregates_processed.load(Ordering::Relaxed),
            price_updates: self.price_updates.load(Ordering::Relaxed),
            whale_alerts: self.whale_alerts.load(Ordering::Relaxed),
            stream_recoveries: self.stream_recoveries.load(Ordering::Relaxed),
            stale_lock_recoveries: self.stale_lock_recoveries.load(Ordering::Relaxed),
            dlq_writes: self.dlq_writes.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
            system_health_percent: *self.system_health_percent.lock(),
            active_services: self.active_services.load(Ordering::Relaxed),
            pending_opportunities: self.pending_opportunities.load(Ordering::Relaxed),
            active_pairs: self.active_pairs.load(Ordering::Relaxed),
            average_latency_ms: *self.average_latency_ms.lock(),
            average_memory_bytes: *self.average_memory_bytes.lock(),
        }
    }
}

/// Point-in-time copy of `SystemMetrics`, embedded in the health
/// self-report and the `/status` payload.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub opportunities_seen: u64,
    pub executions_forwarded: u64,
    pub executions_succeeded: u64,
    pub total_profit_usd: f64,
    pub swap_events: u64,
    pub volume_usd: f64,
    pub aggregates_processed: u64,
    pub price_updates: u64,
    pub whale_alerts: u64,
    pub stream_recoveries: u64,
    pub stale_lock_recoveries: u64,
    pub dlq_writes: u64,
    pub rate_limited: u64,
    pub stream_errors: u64,
    pub system_health_percent: f64,
    pub active_services: u64,
    pub pending_opportunities: u64,
    pub active_pairs: u64,
    pub average_latency_ms: f64,
    pub average_memory_bytes: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let metrics = SystemMetrics::new();

        metrics.incr_opportunities_seen();
        metrics.incr_opportunities_seen();
        metrics.incr_executions_forwarded();
        metrics.add_profit_usd(12.5);
        metrics.set_active_services(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.opportunities_seen, 2);
        assert_eq!(snapshot.executions_forwarded, 1);
        assert!((snapshot.total_profit_usd - 12.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.active_services, 3);
    }

    #[test]
    fn test_encode_text_contains_registered_metrics() {
        let metrics = SystemMetrics::new();
        metrics.incr_dlq_writes();

        let text = encode_text();
        assert!(text.contains("coordinator_dlq_writes_total"));
    }
}
