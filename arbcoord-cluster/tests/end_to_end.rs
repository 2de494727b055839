//! End-to-end coordinator scenarios against the in-memory broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arbcoord_cluster::streams;
use arbcoord_cluster::{
    Coordinator, Dependencies, KvStore, LifecycleState, MemoryBroker, RecordingNotifier, StreamBus,
};
use arbcoord_core::config::Config;
use arbcoord_core::metrics::SystemMetrics;

fn test_config(instance_id: &str) -> Config {
    let mut config = Config::default();
    config.coordinator.consumer_id = instance_id.to_string();
    config.coordinator.lock_ttl_ms = 2000;
    config.coordinator.heartbeat_interval_ms = 500;
    config.coordinator.metrics_interval_ms = 50;
    config.coordinator.cleanup_interval_ms = 100;
    config.coordinator.opportunity_cleanup_interval_ms = 5000;
    config
}

fn build(
    broker: Arc<MemoryBroker>,
    config: Config,
) -> (Arc<Coordinator>, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::new());
    let coordinator = Arc::new(Coordinator::new(Dependencies {
        broker,
        notifier: notifier.clone(),
        config,
        metrics: Arc::new(SystemMetrics::new()),
    }));
    (coordinator, notifier)
}

fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::test]
async fn test_opportunity_flows_to_execution_stream() {
    let broker = Arc::new(MemoryBroker::new());
    let (coordinator, _) = build(broker.clone(), test_config("coord-e2e"));

    coordinator.start().await.expect("start");
    assert_eq!(coordinator.state(), LifecycleState::Running);
    assert!(coordinator.is_leader());

    broker
        .append(
            streams::OPPORTUNITIES,
            &fields(&[
                ("id", "opp-1"),
                ("confidence", "0.92"),
                ("timestamp", &now_ms().to_string()),
                ("chain", "ethereum"),
                ("buyDex", "uniswap"),
                ("sellDex", "sushiswap"),
                ("profitPercentage", "1.5"),
            ]),
        )
        .await
        .expect("append");

    tokio::time::sleep(Duration::from_millis(400)).await;

    let requests = broker.stream_entries(streams::EXECUTION_REQUESTS);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].fields["id"], "opp-1");
    assert_eq!(requests[0].fields["forwardedBy"], "coord-e2e");
    assert_eq!(requests[0].fields["type"], "arbitrage");

    // The opportunity message was acked after handling
    assert!(broker
        .pending_ids(streams::OPPORTUNITIES, "coordinator")
        .is_empty());

    let status = coordinator.status();
    assert_eq!(status.metrics.opportunities_seen, 1);
    assert_eq!(status.metrics.executions_forwarded, 1);

    coordinator.stop().await;
    assert_eq!(coordinator.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_duplicate_opportunities_forward_twice() {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = test_config("coord-dup");
    // Keep the cleanup tick away from the dedup window under test
    config.coordinator.opportunity_cleanup_interval_ms = 60_000;
    let (coordinator, _) = build(broker.clone(), config);
    coordinator.start().await.expect("start");

    let base = now_ms();
    for offset in [0i64, 1000, 9000] {
        broker
            .append(
                streams::OPPORTUNITIES,
                &fields(&[
                    ("id", "X"),
                    ("timestamp", &(base + offset).to_string()),
                    ("confidence", "0.8"),
                ]),
            )
            .await
            .expect("append");
    }

    tokio::time::sleep(Duration::from_millis(400)).await;

    // First arrival forwards; +1000ms is a duplicate; +9000ms re-forwards
    assert_eq!(broker.stream_len(streams::EXECUTION_REQUESTS), 2);

    let status = coordinator.status();
    assert_eq!(status.pending_opportunities, 1);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_follower_does_not_forward() {
    let broker = Arc::new(MemoryBroker::new());

    // Another instance already holds the lock
    broker
        .set_if_absent("coordinator:leader:lock", "other", Duration::from_secs(30))
        .await
        .expect("seed lock");

    let (coordinator, _) = build(broker.clone(), test_config("coord-follower"));
    coordinator.start().await.expect("start");
    assert!(!coordinator.is_leader());

    broker
        .append(
            streams::OPPORTUNITIES,
            &fields(&[("id", "opp-1"), ("timestamp", &now_ms().to_string())]),
        )
        .await
        .expect("append");

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(broker.stream_len(streams::EXECUTION_REQUESTS), 0);
    // Stored for the leader-to-be, acked on the stream
    assert_eq!(coordinator.status().pending_opportunities, 1);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_standby_activation_enables_forwarding() {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = test_config("coord-standby");
    config.coordinator.is_standby = true;
    let (coordinator, _) = build(broker.clone(), config);

    coordinator.start().await.expect("start");
    assert!(!coordinator.is_leader());
    assert!(broker.kv_get("coordinator:leader:lock").is_none());

    assert!(coordinator.activate_standby().await);
    assert!(coordinator.is_leader());

    broker
        .append(
            streams::OPPORTUNITIES,
            &fields(&[("id", "opp-1"), ("timestamp", &now_ms().to_string())]),
        )
        .await
        .expect("append");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(broker.stream_len(streams::EXECUTION_REQUESTS), 1);
    coordinator.stop().await;
}

#[tokio::test]
async fn test_orphan_recovery_runs_during_start() {
    let broker = Arc::new(MemoryBroker::new());
    broker
        .create_group(streams::OPPORTUNITIES, "coordinator", "$")
        .await
        .expect("group");

    let seed: HashMap<String, String> = [
        ("id".to_string(), "orphan-1".to_string()),
        ("timestamp".to_string(), now_ms().to_string()),
    ]
    .into_iter()
    .collect();
    broker.seed_pending(
        streams::OPPORTUNITIES,
        "coordinator",
        "crashed-peer",
        seed,
        Duration::from_secs(120),
    );

    let (coordinator, _) = build(broker.clone(), test_config("coord-recover"));
    coordinator.start().await.expect("start");

    let dlq = broker.stream_entries(streams::DEAD_LETTER_QUEUE);
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].fields["originalStream"], streams::OPPORTUNITIES);
    assert_eq!(dlq[0].fields["error"], "Orphaned PEL message recovered");
    assert!(broker
        .pending_ids(streams::OPPORTUNITIES, "coordinator")
        .is_empty());
    assert_eq!(coordinator.status().metrics.stream_recoveries, 1);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_health_reports_shape_status_snapshot() {
    let broker = Arc::new(MemoryBroker::new());
    let (coordinator, _) = build(broker.clone(), test_config("coord-health"));
    coordinator.start().await.expect("start");

    for (name, status) in [
        ("EXECUTION_ENGINE", "healthy"),
        ("detector-eth", "healthy"),
        ("detector-bsc", "unhealthy"),
    ] {
        broker
            .append(
                streams::HEALTH,
                &fields(&[
                    ("name", name),
                    ("status", status),
                    ("uptime", "3600"),
                    ("memoryUsage", "104857600"),
                    ("cpuUsage", "10"),
                    ("timestamp", &now_ms().to_string()),
                ]),
            )
            .await
            .expect("append");
    }

    tokio::time::sleep(Duration::from_millis(400)).await;

    let status = coordinator.status();
    assert!(status.services.contains_key("detector-bsc"));
    assert_eq!(
        status.degradation_tier,
        Some(arbcoord_cluster::DegradationTier::ReducedChains)
    );
    assert!(status.metrics.system_health_percent > 0.0);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_self_report_is_published() {
    let broker = Arc::new(MemoryBroker::new());
    let (coordinator, _) = build(broker.clone(), test_config("coord-report"));
    coordinator.start().await.expect("start");

    tokio::time::sleep(Duration::from_millis(400)).await;

    let reports: Vec<_> = broker
        .stream_entries(streams::HEALTH)
        .into_iter()
        .filter(|m| m.fields.get("name").map(String::as_str) == Some("coordinator"))
        .collect();
    assert!(!reports.is_empty());
    let report = &reports[0];
    assert_eq!(report.fields["service"], "coordinator");
    assert_eq!(report.fields["isLeader"], "true");
    assert!(report.fields["metrics"].contains("opportunities_seen"));

    coordinator.stop().await;
}

#[tokio::test]
async fn test_lifecycle_is_single_flight() {
    let broker = Arc::new(MemoryBroker::new());
    let (coordinator, _) = build(broker.clone(), test_config("coord-lifecycle"));

    coordinator.start().await.expect("start");
    // A second start while running is rejected
    assert!(coordinator.start().await.is_err());

    coordinator.stop().await;
    assert_eq!(coordinator.state(), LifecycleState::Stopped);
    // Stopping again is a no-op
    coordinator.stop().await;
    assert_eq!(coordinator.state(), LifecycleState::Stopped);

    // A stopped coordinator can start again
    coordinator.start().await.expect("restart");
    coordinator.stop().await;
}

#[tokio::test]
async fn test_stop_clears_in_memory_state() {
    let broker = Arc::new(MemoryBroker::new());
    let (coordinator, _) = build(broker.clone(), test_config("coord-clear"));
    coordinator.start().await.expect("start");

    broker
        .append(
            streams::OPPORTUNITIES,
            &fields(&[("id", "opp-1"), ("timestamp", &now_ms().to_string())]),
        )
        .await
        .expect("append");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.status().pending_opportunities, 1);

    coordinator.stop().await;

    let status = coordinator.status();
    assert_eq!(status.pending_opportunities, 0);
    assert!(status.services.is_empty());
    assert!(!status.is_leader);

    // The lock was released for the next instance
    assert!(broker.kv_get("coordinator:leader:lock").is_none());
}
