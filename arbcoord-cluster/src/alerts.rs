//! Outbound alerting with per-key cooldown.
//!
//! Alerts are fire-and-forget: dispatch happens on a spawned task and
//! notifier failures are logged, never surfaced to the caller.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use arbcoord_core::metrics::coordinator::ALERTS_SENT;
use arbcoord_core::resilience::timeout::WEBHOOK_REQUEST_TIMEOUT;

/// Cooldown entries older than this are garbage-collected
const COOLDOWN_GC_AGE: Duration = Duration::from_secs(3600);

/// Inline prune threshold for the cooldown table
const COOLDOWN_PRUNE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    High,
    Critical,
}

impl AlertSeverity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    LeaderDemotion,
    StreamConsumerFailure,
    StreamRecovered,
    ExecutionCircuitOpen,
    ServiceUnhealthy,
    SystemHealthLow,
    WhaleAlert,
}

impl AlertKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LeaderDemotion => "LEADER_DEMOTION",
            Self::StreamConsumerFailure => "STREAM_CONSUMER_FAILURE",
            Self::StreamRecovered => "STREAM_RECOVERED",
            Self::ExecutionCircuitOpen => "EXECUTION_CIRCUIT_OPEN",
            Self::ServiceUnhealthy => "SERVICE_UNHEALTHY",
            Self::SystemHealthLow => "SYSTEM_HEALTH_LOW",
            Self::WhaleAlert => "WHALE_ALERT",
        }
    }
}

/// A dispatched alert. Details are a permissive JSON map.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub severity: AlertSeverity,
    pub service: Option<String>,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp_ms: i64,
}

/// Transport for outbound alerts
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert);
}

/// Notifier that drops everything (alerting disabled)
#[derive(Default)]
pub struct NoopNotifier;

#[async_trait]
impl AlertNotifier for NoopNotifier {
    async fn notify(&self, _alert: &Alert) {}
}

/// Test double that records every alert it receives
#[derive(Default)]
pub struct RecordingNotifier {
    received: parking_lot::Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.received.lock().clone()
    }

    #[must_use]
    pub fn count_of(&self, kind: AlertKind) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|a| a.kind == kind.as_str())
            .count()
    }
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) {
        self.received.lock().push(alert.clone());
    }
}

/// Discord/Slack webhook notifier. A channel with an empty URL is skipped.
pub struct WebhookNotifier {
    client: reqwest::Client,
    discord_url: Option<String>,
    slack_url: Option<String>,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(discord_url: &str, slack_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            discord_url: (!discord_url.is_empty()).then(|| discord_url.to_string()),
            slack_url: (!slack_url.is_empty()).then(|| slack_url.to_string()),
        }
    }

    fn format_message(alert: &Alert) -> String {
        let service = alert.service.as_deref().unwrap_or("system");
        format!(
            "[{}] {} ({}): {}",
            alert.severity.as_str().to_uppercase(),
            alert.kind,
            service,
            alert.message
        )
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) {
        let text = Self::format_message(alert);

        if let Some(url) = &self.discord_url {
            let payload = serde_json::json!({ "content": text });
            if let Err(e) = self.client.post(url).json(&payload).send().await {
                warn!(error = %e, "Failed to deliver Discord alert");
            }
        }

        if let Some(url) = &self.slack_url {
            let payload = serde_json::json!({ "text": text });
            if let Err(e) = self.client.post(url).json(&payload).send().await {
                warn!(error = %e, "Failed to deliver Slack alert");
            }
        }
    }
}

/// Alert dispatcher with per-`{type}_{service}` cooldown
pub struct AlertManager {
    notifier: Arc<dyn AlertNotifier>,
    cooldown: Duration,
    /// Alert key -> last fired (epoch ms)
    last_fired: DashMap<String, i64>,
}

impl AlertManager {
    #[must_use]
    pub fn new(notifier: Arc<dyn AlertNotifier>, cooldown: Duration) -> Self {
        Self {
            notifier,
            cooldown,
            last_fired: DashMap::new(),
        }
    }

    /// Dispatch an alert unless its key is still cooling down.
    /// Returns whether the alert actually fired.
    pub fn send(
        &self,
        kind: AlertKind,
        severity: AlertSeverity,
        service: Option<&str>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> bool {
        let now = Utc::now().timestamp_millis();
        let key = format!("{}_{}", kind.as_str(), service.unwrap_or("system"));

        if let Some(last) = self.last_fired.get(&key) {
            if now - *last < self.cooldown.as_millis() as i64 {
                debug!(alert_key = %key, "Alert suppressed by cooldown");
                return false;
            }
        }
        self.last_fired.insert(key.clone(), now);

        if self.last_fired.len() > COOLDOWN_PRUNE_SIZE {
            self.prune(now);
        }

        let alert = Alert {
            kind: kind.as_str(),
            severity,
            service: service.map(ToString::to_string),
            message: message.into(),
            details,
            timestamp_ms: now,
        };

        match severity {
            AlertSeverity::Critical => {
                error!(alert_key = %key, message = %alert.message, "Dispatching critical alert");
            }
            AlertSeverity::High => {
                warn!(alert_key = %key, message = %alert.message, "Dispatching alert");
            }
            AlertSeverity::Low => {
                info!(alert_key = %key, message = %alert.message, "Dispatching alert");
            }
        }
        ALERTS_SENT
            .with_label_values(&[alert.kind, severity.as_str()])
            .inc();

        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier.notify(&alert).await;
        });

        true
    }

    /// Drop cooldown entries older than one hour. Runs on the general
    /// cleanup tick and inline when the table grows past the size bound.
    pub fn purge_expired(&self) {
        let now = Utc::now().timestamp_millis();
        self.prune(now);
    }

    fn prune(&self, now_ms: i64) {
        let horizon = now_ms - COOLDOWN_GC_AGE.as_millis() as i64;
        self.last_fired.retain(|_, last| *last >= horizon);
    }

    /// Forget all cooldown state (part of lifecycle teardown)
    pub fn clear(&self) {
        self.last_fired.clear();
    }

    #[must_use]
    pub fn cooldown_entries(&self) -> usize {
        self.last_fired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_recorder(cooldown: Duration) -> (AlertManager, Arc<RecordingNotifier>) {
        let recorder = Arc::new(RecordingNotifier::new());
        let manager = AlertManager::new(recorder.clone(), cooldown);
        (manager, recorder)
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_alerts() {
        let (manager, recorder) = manager_with_recorder(Duration::from_secs(300));

        assert!(manager.send(
            AlertKind::ServiceUnhealthy,
            AlertSeverity::High,
            Some("detector-eth"),
            "detector-eth is unhealthy",
            serde_json::json!({}),
        ));
        assert!(!manager.send(
            AlertKind::ServiceUnhealthy,
            AlertSeverity::High,
            Some("detector-eth"),
            "detector-eth is unhealthy",
            serde_json::json!({}),
        ));

        tokio::task::yield_now().await;
        assert_eq!(recorder.count_of(AlertKind::ServiceUnhealthy), 1);
    }

    #[tokio::test]
    async fn test_cooldown_is_keyed_per_service() {
        let (manager, _recorder) = manager_with_recorder(Duration::from_secs(300));

        assert!(manager.send(
            AlertKind::ServiceUnhealthy,
            AlertSeverity::High,
            Some("detector-eth"),
            "unhealthy",
            serde_json::json!({}),
        ));
        // Different service, same type: not suppressed
        assert!(manager.send(
            AlertKind::ServiceUnhealthy,
            AlertSeverity::High,
            Some("detector-bsc"),
            "unhealthy",
            serde_json::json!({}),
        ));
        // No service falls back to the "system" key
        assert!(manager.send(
            AlertKind::SystemHealthLow,
            AlertSeverity::Critical,
            None,
            "health low",
            serde_json::json!({}),
        ));
    }

    #[tokio::test]
    async fn test_purge_drops_stale_entries() {
        let (manager, _recorder) = manager_with_recorder(Duration::from_millis(10));

        manager.send(
            AlertKind::SystemHealthLow,
            AlertSeverity::Critical,
            None,
            "health low",
            serde_json::json!({}),
        );
        assert_eq!(manager.cooldown_entries(), 1);

        // Entry is newer than the GC horizon, purge keeps it
        manager.purge_expired();
        assert_eq!(manager.cooldown_entries(), 1);

        // Backdate past the horizon, purge removes it
        for mut entry in manager.last_fired.iter_mut() {
            *entry -= COOLDOWN_GC_AGE.as_millis() as i64 + 1000;
        }
        manager.purge_expired();
        assert_eq!(manager.cooldown_entries(), 0);
    }
}
