//! Periodic health aggregation and alert evaluation.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use arbcoord_core::metrics::SystemMetrics;

use super::degradation::{self, DegradationTier, ServicePatterns};
use super::registry::{HealthRegistry, ServiceHealth};
use crate::alerts::{AlertKind, AlertManager, AlertSeverity};

/// System health below this percentage raises a critical alert
const LOW_HEALTH_THRESHOLD: f64 = 80.0;

/// During startup grace, the low-health alert needs this many known services
const GRACE_MIN_SERVICES: usize = 3;

/// Aggregates derived from one evaluation pass
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthReport {
    pub system_health_percent: f64,
    pub active_services: usize,
    pub total_services: usize,
    pub average_memory_bytes: f64,
    pub average_latency_ms: f64,
    pub tier: DegradationTier,
}

pub struct HealthMonitor {
    registry: Arc<HealthRegistry>,
    alerts: Arc<AlertManager>,
    metrics: Arc<SystemMetrics>,
    patterns: ServicePatterns,
    grace_period: Duration,
    started_at: Mutex<Instant>,
    current_tier: Mutex<DegradationTier>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        registry: Arc<HealthRegistry>,
        alerts: Arc<AlertManager>,
        metrics: Arc<SystemMetrics>,
        patterns: ServicePatterns,
        grace_period: Duration,
    ) -> Self {
        Self {
            registry,
            alerts,
            metrics,
            patterns,
            grace_period,
            started_at: Mutex::new(Instant::now()),
            current_tier: Mutex::new(DegradationTier::CompleteOutage),
        }
    }

    /// Rewind the recorded start time (test support for grace behavior)
    pub fn backdate_start(&self, by: Duration) {
        let mut started = self.started_at.lock();
        *started -= by;
    }

    #[must_use]
    pub fn current_tier(&self) -> DegradationTier {
        *self.current_tier.lock()
    }

    /// One metrics pass: aggregate the registry, update gauges, evaluate
    /// the degradation tier and run the alert checker.
    pub fn evaluate(&self) -> SystemHealthReport {
        let snapshot = self.registry.snapshot();
        let now_ms = Utc::now().timestamp_millis();

        let total = snapshot.len();
        let mut healthy = 0usize;
        let mut memory_sum = 0.0;
        let mut latency_sum = 0.0;
        for record in snapshot.values() {
            if record.status == super::registry::ServiceStatus::Healthy {
                healthy += 1;
            }
            memory_sum += record.memory_bytes;
            latency_sum += record.effective_latency_ms(now_ms);
        }

        let system_health = healthy as f64 / total.max(1) as f64 * 100.0;
        let average_memory = if total > 0 { memory_sum / total as f64 } else { 0.0 };
        let average_latency = if total > 0 { latency_sum / total as f64 } else { 0.0 };

        self.metrics.set_system_health_percent(system_health);
        self.metrics.set_active_services(healthy as u64);
        self.metrics.set_average_memory_bytes(average_memory);
        self.metrics.set_average_latency_ms(average_latency);

        let tier = degradation::evaluate(&snapshot, &self.patterns);
        self.transition_tier(tier);

        self.check_alerts(&snapshot, system_health);

        SystemHealthReport {
            system_health_percent: system_health,
            active_services: healthy,
            total_services: total,
            average_memory_bytes: average_memory,
            average_latency_ms: average_latency,
            tier,
        }
    }

    fn transition_tier(&self, tier: DegradationTier) {
        let mut current = self.current_tier.lock();
        if *current != tier {
            warn!(
                previous = current.as_str(),
                current = tier.as_str(),
                "Degradation tier changed"
            );
            *current = tier;
        }
    }

    fn check_alerts(&self, snapshot: &HashMap<String, ServiceHealth>, system_health: f64) {
        let in_grace = self.started_at.lock().elapsed() < self.grace_period;

        if in_grace {
            // Services still booting produce spurious unhealthy reports;
            // only a broadly-observed health collapse alerts during grace
            if snapshot.len() >= GRACE_MIN_SERVICES && system_health < LOW_HEALTH_THRESHOLD {
                self.alerts.send(
                    AlertKind::SystemHealthLow,
                    AlertSeverity::Critical,
                    None,
                    format!("System health at {system_health:.1}% during startup"),
                    serde_json::json!({
                        "systemHealth": system_health,
                        "services": snapshot.len(),
                    }),
                );
            } else {
                debug!(
                    services = snapshot.len(),
                    system_health = system_health,
                    "Startup grace period active, suppressing service alerts"
                );
            }
            return;
        }

        for record in snapshot.values() {
            if record.status.is_alerting() {
                self.alerts.send(
                    AlertKind::ServiceUnhealthy,
                    AlertSeverity::High,
                    Some(&record.name),
                    format!("{} is {}", record.name, record.status.as_str()),
                    serde_json::json!({
                        "service": record.name,
                        "status": record.status.as_str(),
                        "lastHeartbeat": record.last_heartbeat_ms,
                    }),
                );
            }
        }

        if system_health < LOW_HEALTH_THRESHOLD {
            self.alerts.send(
                AlertKind::SystemHealthLow,
                AlertSeverity::Critical,
                None,
                format!("System health at {system_health:.1}%"),
                serde_json::json!({
                    "systemHealth": system_health,
                    "services": snapshot.len(),
                }),
            );
        }
    }
}
