//! Per-service health records, keyed by service name.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;

use crate::ingest::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Starting,
    Stopping,
}

impl ServiceStatus {
    /// Parse a reported status. Unknown inputs coerce to `Unhealthy`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "healthy" => Self::Healthy,
            "degraded" => Self::Degraded,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            _ => Self::Unhealthy,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
        }
    }

    /// Lifecycle states that never alert
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }

    /// Whether this status should raise a service alert
    #[must_use]
    pub const fn is_alerting(self) -> bool {
        !matches!(self, Self::Healthy | Self::Starting | Self::Stopping)
    }
}

/// Health record for one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: ServiceStatus,
    pub uptime_secs: f64,
    pub memory_bytes: f64,
    pub cpu_percent: f64,
    pub last_heartbeat_ms: i64,
    pub consecutive_failures: Option<u64>,
    pub restart_count: Option<u64>,
    /// Explicit latency; when absent, heartbeat age is the effective latency
    pub latency_ms: Option<f64>,
}

impl ServiceHealth {
    /// Effective latency: the explicit value when reported, otherwise the
    /// age of the last heartbeat.
    #[must_use]
    pub fn effective_latency_ms(&self, now_ms: i64) -> f64 {
        self.latency_ms
            .unwrap_or_else(|| (now_ms - self.last_heartbeat_ms).max(0) as f64)
    }
}

/// Registry of fleet health, mutated only by the health stream handler.
/// Records are never removed: staleness is judged by heartbeat age.
#[derive(Default)]
pub struct HealthRegistry {
    services: DashMap<String, ServiceHealth>,
}

impl HealthRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one health envelope. Returns the service name, or `None` when
    /// the envelope names no service.
    pub fn apply(&self, envelope: &Envelope) -> Option<String> {
        // `name` preferred, `service` accepted for older reporters
        let name = envelope.get_any(&["name", "service"])?.to_string();

        let status = ServiceStatus::parse(envelope.get("status").unwrap_or_default());
        let record = ServiceHealth {
            name: name.clone(),
            status,
            uptime_secs: envelope.get_f64("uptime").unwrap_or(0.0).max(0.0),
            memory_bytes: envelope.get_f64("memoryUsage").unwrap_or(0.0).max(0.0),
            cpu_percent: envelope.get_f64("cpuUsage").unwrap_or(0.0).max(0.0),
            last_heartbeat_ms: envelope
                .get_i64("timestamp")
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            consecutive_failures: envelope.get_i64("consecutiveFailures").map(|v| v.max(0) as u64),
            restart_count: envelope.get_i64("restartCount").map(|v| v.max(0) as u64),
            latency_ms: envelope.get_f64("latency").map(|v| v.max(0.0)),
        };

        self.services.insert(name.clone(), record);
        Some(name)
    }

    /// Coerce a record's status (legacy stale polling)
    pub fn mark_unhealthy(&self, name: &str) {
        if let Some(mut record) = self.services.get_mut(name) {
            record.status = ServiceStatus::Unhealthy;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Copy of every record, detached from the live map
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, ServiceHealth> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.services.clear();
    }
}
