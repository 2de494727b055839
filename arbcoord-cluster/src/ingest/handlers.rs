//! Per-stream handlers wiring envelopes into coordinator state.
//!
//! Handlers are idempotent: redelivered messages settle into the same
//! final state. A returned error sends the message to the DLQ.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use arbcoord_core::metrics::SystemMetrics;

use super::consumer::StreamHandler;
use super::envelope::Envelope;
use crate::alerts::{AlertKind, AlertManager, AlertSeverity};
use crate::analytics::ActivePairTracker;
use crate::health::HealthRegistry;
use crate::routing::OpportunityRouter;

/// `stream:health`: upserts fleet health records
pub struct HealthStreamHandler {
    pub registry: Arc<HealthRegistry>,
}

#[async_trait]
impl StreamHandler for HealthStreamHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let Some(name) = self.registry.apply(envelope) else {
            anyhow::bail!("health report names no service");
        };
        debug!(service = %name, "Applied health report");
        Ok(())
    }
}

/// `stream:opportunities`: delegates triage to the router
pub struct OpportunityStreamHandler {
    pub router: Arc<OpportunityRouter>,
}

#[async_trait]
impl StreamHandler for OpportunityStreamHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        // Drops (duplicate, out-of-range, missing id) are terminal and
        // logged by the router; they are not handler failures
        self.router.ingest(envelope).await;
        Ok(())
    }
}

/// `stream:whale-alerts`: surfaces large transfers as notifications
pub struct WhaleAlertHandler {
    pub alerts: Arc<AlertManager>,
    pub metrics: Arc<SystemMetrics>,
}

#[async_trait]
impl StreamHandler for WhaleAlertHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let Some(address) = envelope.get("address") else {
            anyhow::bail!("whale alert missing address");
        };
        let usd_value = envelope.get_f64("usdValue").unwrap_or(0.0);
        let direction = envelope.get("direction").unwrap_or("unknown");
        let chain = envelope.get("chain").unwrap_or("unknown");

        self.metrics.incr_whale_alerts();
        self.alerts.send(
            AlertKind::WhaleAlert,
            AlertSeverity::Low,
            None,
            format!("Whale {direction} of ${usd_value:.0} on {chain}"),
            serde_json::json!({
                "address": address,
                "usdValue": usd_value,
                "direction": direction,
                "chain": chain,
                "dex": envelope.get("dex"),
                "impact": envelope.get("impact"),
            }),
        );
        Ok(())
    }
}

/// `stream:swap-events`: wrapped envelopes feeding pair activity
pub struct SwapEventHandler {
    pub pairs: Arc<ActivePairTracker>,
    pub metrics: Arc<SystemMetrics>,
}

#[async_trait]
impl StreamHandler for SwapEventHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let Some(pair) = envelope.get("pairAddress") else {
            anyhow::bail!("swap event missing pairAddress");
        };
        self.pairs.touch(
            pair,
            envelope.get("chain").unwrap_or_default(),
            envelope.get("dex").unwrap_or_default(),
        );
        self.metrics.incr_swap_events();
        self.metrics
            .add_volume_usd(envelope.get_f64("usdValue").unwrap_or(0.0).max(0.0));
        Ok(())
    }
}

/// `stream:volume-aggregates`: windowed volume rollups
pub struct VolumeAggregateHandler {
    pub pairs: Arc<ActivePairTracker>,
    pub metrics: Arc<SystemMetrics>,
}

#[async_trait]
impl StreamHandler for VolumeAggregateHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let Some(pair) = envelope.get("pairAddress") else {
            anyhow::bail!("volume aggregate missing pairAddress");
        };
        self.pairs.touch(
            pair,
            envelope.get("chain").unwrap_or_default(),
            envelope.get("dex").unwrap_or_default(),
        );
        self.metrics.incr_aggregates_processed();
        self.metrics
            .add_volume_usd(envelope.get_f64("totalUsdVolume").unwrap_or(0.0).max(0.0));
        Ok(())
    }
}

/// `stream:price-updates`: per-pair price ticks
pub struct PriceUpdateHandler {
    pub pairs: Arc<ActivePairTracker>,
    pub metrics: Arc<SystemMetrics>,
}

#[async_trait]
impl StreamHandler for PriceUpdateHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let Some(pair_key) = envelope.get("pairKey") else {
            anyhow::bail!("price update missing pairKey");
        };
        self.pairs.touch(
            pair_key,
            envelope.get("chain").unwrap_or_default(),
            envelope.get("dex").unwrap_or_default(),
        );
        self.metrics.incr_price_updates();
        Ok(())
    }
}

/// `stream:execution-results`: outcomes from the execution engine
pub struct ExecutionResultHandler {
    pub router: Arc<OpportunityRouter>,
    pub metrics: Arc<SystemMetrics>,
}

#[async_trait]
impl StreamHandler for ExecutionResultHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let Some(opportunity_id) = envelope.get("opportunityId") else {
            anyhow::bail!("execution result missing opportunityId");
        };
        // `success` arrives as a boolean or the string "true"
        let success = envelope.get_bool("success").unwrap_or(false);

        self.router.record_result(opportunity_id, success);

        if success {
            self.metrics.incr_executions_succeeded();
            // Negative profit reports are clamped before accumulation
            let profit = envelope.get_f64("actualProfit").unwrap_or(0.0).max(0.0);
            self.metrics.add_profit_usd(profit);
            info!(
                opportunity_id = %opportunity_id,
                profit = profit,
                "Execution succeeded"
            );
        } else {
            info!(
                opportunity_id = %opportunity_id,
                error = envelope.get("error").unwrap_or("unknown"),
                "Execution failed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingNotifier;
    use crate::broker::{MemoryBroker, StreamMessage};
    use crate::election::LeadershipView;
    use crate::routing::{RouterConfig, OpportunityStatus};
    use std::collections::HashMap;
    use std::time::Duration;

    struct NotLeader;
    impl LeadershipView for NotLeader {
        fn is_leader(&self) -> bool {
            false
        }
    }

    fn envelope(pairs: &[(&str, &str)]) -> Envelope {
        let fields: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Envelope::normalize(&StreamMessage::new("1-0", fields))
    }

    fn test_router() -> Arc<OpportunityRouter> {
        let recorder = Arc::new(RecordingNotifier::new());
        Arc::new(OpportunityRouter::new(
            Arc::new(MemoryBroker::new()),
            Arc::new(NotLeader),
            Arc::new(AlertManager::new(recorder, Duration::from_secs(300))),
            Arc::new(SystemMetrics::new()),
            "coord-a".to_string(),
            RouterConfig {
                max_opportunities: 100,
                opportunity_ttl: Duration::from_secs(60),
                execution_stream: "stream:execution-requests".to_string(),
                breaker_threshold: 5,
                breaker_reset: Duration::from_secs(60),
            },
        ))
    }

    #[tokio::test]
    async fn test_health_handler_is_idempotent() {
        let registry = Arc::new(HealthRegistry::new());
        let handler = HealthStreamHandler {
            registry: registry.clone(),
        };
        let report = envelope(&[
            ("name", "detector-eth"),
            ("status", "healthy"),
            ("timestamp", "1700000000000"),
        ]);

        handler.handle(&report).await.unwrap();
        let first = registry.snapshot();
        handler.handle(&report).await.unwrap();
        let second = registry.snapshot();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(
            first["detector-eth"].last_heartbeat_ms,
            second["detector-eth"].last_heartbeat_ms
        );
    }

    #[tokio::test]
    async fn test_health_handler_rejects_anonymous_reports() {
        let handler = HealthStreamHandler {
            registry: Arc::new(HealthRegistry::new()),
        };
        assert!(handler.handle(&envelope(&[("status", "healthy")])).await.is_err());
    }

    #[tokio::test]
    async fn test_swap_handler_unwraps_and_tracks_pairs() {
        let pairs = Arc::new(ActivePairTracker::new(Duration::from_secs(300)));
        let metrics = Arc::new(SystemMetrics::new());
        let handler = SwapEventHandler {
            pairs: pairs.clone(),
            metrics: metrics.clone(),
        };

        let wrapped = envelope(&[
            ("type", "swap-event"),
            (
                "data",
                r#"{"pairAddress":"0xabc","chain":"ethereum","dex":"uniswap","usdValue":500.0,"transactionHash":"0xdead"}"#,
            ),
        ]);
        handler.handle(&wrapped).await.unwrap();

        assert_eq!(pairs.len(), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.swap_events, 1);
        assert!((snapshot.volume_usd - 500.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_execution_result_accepts_string_true_and_clamps_profit() {
        let router = test_router();
        router
            .ingest(&envelope(&[("id", "opp-1")]))
            .await;
        let metrics = Arc::new(SystemMetrics::new());
        let handler = ExecutionResultHandler {
            router: router.clone(),
            metrics: metrics.clone(),
        };

        handler
            .handle(&envelope(&[
                ("opportunityId", "opp-1"),
                ("success", "true"),
                ("actualProfit", "-12.5"),
            ]))
            .await
            .unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.executions_succeeded, 1);
        assert!((snapshot.total_profit_usd - 0.0).abs() < f64::EPSILON);
        assert_eq!(
            router.snapshot()[0].status,
            OpportunityStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_whale_handler_counts_and_alerts() {
        let recorder = Arc::new(RecordingNotifier::new());
        let metrics = Arc::new(SystemMetrics::new());
        let handler = WhaleAlertHandler {
            alerts: Arc::new(AlertManager::new(recorder.clone(), Duration::from_secs(0))),
            metrics: metrics.clone(),
        };

        handler
            .handle(&envelope(&[
                ("address", "0xwhale"),
                ("usdValue", "2500000"),
                ("direction", "sell"),
                ("chain", "ethereum"),
            ]))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(metrics.snapshot().whale_alerts, 1);
        assert_eq!(recorder.count_of(AlertKind::WhaleAlert), 1);
    }

    #[tokio::test]
    async fn test_price_update_requires_pair_key() {
        let handler = PriceUpdateHandler {
            pairs: Arc::new(ActivePairTracker::new(Duration::from_secs(300))),
            metrics: Arc::new(SystemMetrics::new()),
        };
        let wrapped = envelope(&[
            ("type", "price-update"),
            ("data", r#"{"chain":"bsc","dex":"pancake","price":1.01}"#),
        ]);
        assert!(handler.handle(&wrapped).await.is_err());
    }
}
