//! Coordinator lifecycle orchestration.
//!
//! Owns the start/stop state machine, wires the components from injected
//! dependencies and drives the periodic loops: health metrics and
//! self-reporting, opportunity cleanup and general cleanup.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arbcoord_core::config::Config;
use arbcoord_core::metrics::{MetricsSnapshot, SystemMetrics};
use arbcoord_core::proc::{rss_bytes, CpuSampler};
use arbcoord_core::resilience::timeout::{BROKER_DISCONNECT_TIMEOUT, TASK_SHUTDOWN_TIMEOUT};

use crate::alerts::{AlertManager, AlertNotifier};
use crate::analytics::ActivePairTracker;
use crate::broker::{Broker, KvStore, StreamBus};
use crate::election::{ElectorConfig, LeaderElector, LeadershipView};
use crate::error::{Error, Result};
use crate::health::{
    DegradationTier, HealthMonitor, HealthRegistry, ServiceHealth, ServicePatterns,
};
use crate::ingest::consumer::ConsumerConfig;
use crate::ingest::handlers::{
    ExecutionResultHandler, HealthStreamHandler, OpportunityStreamHandler, PriceUpdateHandler,
    SwapEventHandler, VolumeAggregateHandler, WhaleAlertHandler,
};
use crate::ingest::{RateLimiter, StreamConsumerManager};
use crate::routing::{OpportunityRouter, RouterConfig};
use crate::streams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl LifecycleState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Error => "ERROR",
        }
    }
}

/// Explicit dependency injection: no client singletons. The test suite
/// substitutes an in-memory broker and a recording notifier.
pub struct Dependencies {
    pub broker: Arc<dyn Broker>,
    pub notifier: Arc<dyn AlertNotifier>,
    pub config: Config,
    pub metrics: Arc<SystemMetrics>,
}

/// Components alive while the coordinator is running
struct Running {
    elector: Arc<LeaderElector>,
    consumer: Arc<StreamConsumerManager>,
    router: Arc<OpportunityRouter>,
    registry: Arc<HealthRegistry>,
    monitor: Arc<HealthMonitor>,
    pairs: Arc<ActivePairTracker>,
    alerts: Arc<AlertManager>,
    rate_limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started_at: Instant,
}

/// Point-in-time snapshot served by the HTTP surface
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: LifecycleState,
    pub instance_id: String,
    pub region_id: String,
    pub is_leader: bool,
    pub is_standby: bool,
    pub degradation_tier: Option<DegradationTier>,
    pub uptime_secs: u64,
    pub pending_opportunities: usize,
    pub active_pairs: usize,
    pub services: HashMap<String, ServiceHealth>,
    pub metrics: MetricsSnapshot,
}

pub struct Coordinator {
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn AlertNotifier>,
    config: Config,
    metrics: Arc<SystemMetrics>,
    instance_id: String,
    /// Serializes start/stop so lifecycle callbacks run once-at-a-time
    lifecycle_gate: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<LifecycleState>,
    running: parking_lot::Mutex<Option<Arc<Running>>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(deps: Dependencies) -> Self {
        let instance_id =
            arbcoord_core::instance::resolve_instance_id(&deps.config.coordinator.consumer_id);
        Self {
            broker: deps.broker,
            notifier: deps.notifier,
            config: deps.config,
            metrics: deps.metrics,
            instance_id,
            lifecycle_gate: tokio::sync::Mutex::new(()),
            state: parking_lot::Mutex::new(LifecycleState::Stopped),
            running: parking_lot::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| r.elector.is_leader())
    }

    fn set_state(&self, state: LifecycleState) {
        let mut current = self.state.lock();
        debug!(from = current.as_str(), to = state.as_str(), "Lifecycle transition");
        *current = state;
    }

    /// Start the coordinator. Errors when already starting or running.
    pub async fn start(&self) -> Result<()> {
        let _gate = self.lifecycle_gate.lock().await;

        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Stopped | LifecycleState::Error => {
                    *state = LifecycleState::Starting;
                }
                other => {
                    return Err(Error::Lifecycle(format!(
                        "cannot start from state {}",
                        other.as_str()
                    )));
                }
            }
        }

        info!(instance_id = %self.instance_id, "Coordinator starting");
        match self.do_start().await {
            Ok(running) => {
                *self.running.lock() = Some(Arc::new(running));
                self.set_state(LifecycleState::Running);
                info!(instance_id = %self.instance_id, "Coordinator running");
                Ok(())
            }
            Err(e) => {
                self.set_state(LifecycleState::Error);
                Err(e)
            }
        }
    }

    async fn do_start(&self) -> Result<Running> {
        let started_at = Instant::now();
        let coordinator_cfg = &self.config.coordinator;

        let cooldown = coordinator_cfg.effective_alert_cooldown(self.config.server.development_mode);
        let alerts = Arc::new(AlertManager::new(self.notifier.clone(), cooldown));
        let rate_limiter = Arc::new(RateLimiter::new(
            self.config.rate_limit.max_tokens,
            Duration::from_millis(self.config.rate_limit.refill_ms),
        ));
        let registry = Arc::new(HealthRegistry::new());
        let pairs = Arc::new(ActivePairTracker::new(coordinator_cfg.pair_ttl()));

        let elector = Arc::new(LeaderElector::new(
            self.broker.clone(),
            ElectorConfig {
                lock_key: coordinator_cfg.lock_key.clone(),
                instance_id: self.instance_id.clone(),
                lock_ttl: coordinator_cfg.lock_ttl(),
                heartbeat_interval: coordinator_cfg.heartbeat_interval(),
                is_standby: coordinator_cfg.is_standby,
                can_become_leader: coordinator_cfg.can_become_leader,
            },
            alerts.clone(),
            self.metrics.clone(),
        ));

        let router = Arc::new(OpportunityRouter::new(
            self.broker.clone(),
            elector.clone() as Arc<dyn LeadershipView>,
            alerts.clone(),
            self.metrics.clone(),
            self.instance_id.clone(),
            RouterConfig {
                max_opportunities: coordinator_cfg.max_opportunities,
                opportunity_ttl: coordinator_cfg.opportunity_ttl(),
                execution_stream: coordinator_cfg.execution_stream.clone(),
                breaker_threshold: self.config.circuit_breaker.threshold,
                breaker_reset: Duration::from_millis(self.config.circuit_breaker.reset_ms),
            },
        ));

        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            alerts.clone(),
            self.metrics.clone(),
            ServicePatterns::default(),
            coordinator_cfg.startup_grace_period(),
        ));

        let mut consumer_cfg = ConsumerConfig::new(
            &coordinator_cfg.consumer_group,
            &self.instance_id,
            &coordinator_cfg.dlq_stream,
        );
        consumer_cfg.orphan_idle_threshold = coordinator_cfg.orphan_idle_threshold();
        consumer_cfg.max_stream_errors = coordinator_cfg.max_stream_errors;
        let consumer = Arc::new(StreamConsumerManager::new(
            self.broker.clone(),
            consumer_cfg,
            rate_limiter.clone(),
            alerts.clone(),
            self.metrics.clone(),
        ));

        consumer.register(
            streams::HEALTH,
            Arc::new(HealthStreamHandler {
                registry: registry.clone(),
            }),
        );
        consumer.register(
            streams::OPPORTUNITIES,
            Arc::new(OpportunityStreamHandler {
                router: router.clone(),
            }),
        );
        consumer.register(
            streams::WHALE_ALERTS,
            Arc::new(WhaleAlertHandler {
                alerts: alerts.clone(),
                metrics: self.metrics.clone(),
            }),
        );
        consumer.register(
            streams::SWAP_EVENTS,
            Arc::new(SwapEventHandler {
                pairs: pairs.clone(),
                metrics: self.metrics.clone(),
            }),
        );
        consumer.register(
            streams::VOLUME_AGGREGATES,
            Arc::new(VolumeAggregateHandler {
                pairs: pairs.clone(),
                metrics: self.metrics.clone(),
            }),
        );
        consumer.register(
            streams::PRICE_UPDATES,
            Arc::new(PriceUpdateHandler {
                pairs: pairs.clone(),
                metrics: self.metrics.clone(),
            }),
        );
        consumer.register(
            streams::EXECUTION_RESULTS,
            Arc::new(ExecutionResultHandler {
                router: router.clone(),
                metrics: self.metrics.clone(),
            }),
        );

        // Groups plus orphan recovery must succeed before readers start
        consumer.prepare().await?;

        // Initial leadership attempt; a broker hiccup here is not fatal,
        // the heartbeat loop keeps contending
        match elector.try_acquire_leadership().await {
            Ok(true) => info!("Initial leadership acquired"),
            Ok(false) => info!("Starting as follower"),
            Err(e) => warn!(error = %e, "Initial leadership attempt failed"),
        }

        consumer.start_readers();

        let cancel = CancellationToken::new();
        let mut tasks = vec![elector.start_heartbeat()];
        tasks.push(self.spawn_metrics_loop(
            &cancel,
            elector.clone(),
            monitor.clone(),
            pairs.clone(),
            started_at,
        ));
        tasks.push(self.spawn_opportunity_cleanup_loop(&cancel, router.clone()));
        tasks.push(self.spawn_general_cleanup_loop(
            &cancel,
            pairs.clone(),
            alerts.clone(),
            registry.clone(),
        ));

        Ok(Running {
            elector,
            consumer,
            router,
            registry,
            monitor,
            pairs,
            alerts,
            rate_limiter,
            cancel,
            tasks: parking_lot::Mutex::new(tasks),
            started_at,
        })
    }

    fn spawn_metrics_loop(
        &self,
        cancel: &CancellationToken,
        elector: Arc<LeaderElector>,
        monitor: Arc<HealthMonitor>,
        pairs: Arc<ActivePairTracker>,
        started_at: Instant,
    ) -> tokio::task::JoinHandle<()> {
        let cancel = cancel.clone();
        let broker = self.broker.clone();
        let metrics = self.metrics.clone();
        let instance_id = self.instance_id.clone();
        let interval = Duration::from_millis(self.config.coordinator.metrics_interval_ms);
        let cpu = CpuSampler::new();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }

                monitor.evaluate();
                metrics.set_active_pairs(pairs.len() as u64);

                let snapshot = metrics.snapshot();
                let report = vec![
                    ("name".to_string(), "coordinator".to_string()),
                    ("service".to_string(), "coordinator".to_string()),
                    ("status".to_string(), "healthy".to_string()),
                    ("isLeader".to_string(), elector.is_leader().to_string()),
                    (
                        "uptime".to_string(),
                        started_at.elapsed().as_secs().to_string(),
                    ),
                    ("memoryUsage".to_string(), rss_bytes().to_string()),
                    (
                        "cpuUsage".to_string(),
                        format!("{:.2}", cpu.sample_percent()),
                    ),
                    (
                        "timestamp".to_string(),
                        Utc::now().timestamp_millis().to_string(),
                    ),
                    (
                        "metrics".to_string(),
                        serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string()),
                    ),
                    ("instanceId".to_string(), instance_id.clone()),
                ];

                if let Err(e) = broker
                    .append_capped(streams::HEALTH, &report, streams::PRODUCED_STREAM_MAXLEN)
                    .await
                {
                    debug!(error = %e, "Self-report publish skipped");
                }
            }
        })
    }

    fn spawn_opportunity_cleanup_loop(
        &self,
        cancel: &CancellationToken,
        router: Arc<OpportunityRouter>,
    ) -> tokio::task::JoinHandle<()> {
        let cancel = cancel.clone();
        let interval =
            Duration::from_millis(self.config.coordinator.opportunity_cleanup_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                router.cleanup();
            }
        })
    }

    fn spawn_general_cleanup_loop(
        &self,
        cancel: &CancellationToken,
        pairs: Arc<ActivePairTracker>,
        alerts: Arc<AlertManager>,
        registry: Arc<HealthRegistry>,
    ) -> tokio::task::JoinHandle<()> {
        let cancel = cancel.clone();
        let interval = Duration::from_millis(self.config.coordinator.cleanup_interval_ms);
        let legacy_polling = self.config.coordinator.enable_legacy_health_polling;
        let stale_after_ms = (self.config.coordinator.metrics_interval_ms * 3) as i64;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }

                let pruned = pairs.prune();
                if pruned > 0 {
                    debug!(pruned = pruned, "Pruned inactive pairs");
                }
                alerts.purge_expired();

                if legacy_polling {
                    let horizon = Utc::now().timestamp_millis() - stale_after_ms;
                    for (name, record) in registry.snapshot() {
                        if record.last_heartbeat_ms < horizon
                            && record.status == crate::health::ServiceStatus::Healthy
                        {
                            warn!(service = %name, "Heartbeat stale, marking unhealthy");
                            registry.mark_unhealthy(&name);
                        }
                    }
                }
            }
        })
    }

    /// Stop the coordinator: release leadership, cancel the periodic
    /// loops, stop readers, disconnect the broker and clear state.
    pub async fn stop(&self) {
        let _gate = self.lifecycle_gate.lock().await;

        {
            let mut state = self.state.lock();
            match *state {
                LifecycleState::Running | LifecycleState::Error => {
                    *state = LifecycleState::Stopping;
                }
                _ => return,
            }
        }
        info!(instance_id = %self.instance_id, "Coordinator stopping");

        let running = { self.running.lock().take() };
        if let Some(running) = running {
            // Leadership goes first so a successor can take over while we
            // drain
            running.elector.release().await;
            running.elector.stop();

            running.cancel.cancel();
            let tasks: Vec<tokio::task::JoinHandle<()>> = {
                let mut tasks = running.tasks.lock();
                tasks.drain(..).collect()
            };
            for task in tasks {
                let abort = task.abort_handle();
                if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
                    warn!("Periodic task did not stop in time, aborting");
                    abort.abort();
                }
            }

            running.consumer.stop().await;

            if tokio::time::timeout(BROKER_DISCONNECT_TIMEOUT, self.broker.disconnect())
                .await
                .is_err()
            {
                warn!("Broker disconnect timed out");
            }

            running.router.clear();
            running.registry.clear();
            running.pairs.clear();
            running.alerts.clear();
            running.rate_limiter.clear();
        }

        self.set_state(LifecycleState::Stopped);
        info!(instance_id = %self.instance_id, "Coordinator stopped");
    }

    /// Promote this standby instance. Returns false when the coordinator
    /// is not running or the promotion did not win the lock.
    pub async fn activate_standby(&self) -> bool {
        let elector = {
            self.running.lock().as_ref().map(|r| r.elector.clone())
        };
        match elector {
            Some(elector) => elector.activate_standby().await,
            None => {
                warn!("Activation requested while coordinator is not running");
                false
            }
        }
    }

    /// Copy of current state for the HTTP surface
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let running = self.running.lock();
        let (is_leader, is_standby, tier, uptime, pending, pairs, services) = running
            .as_ref()
            .map_or((false, false, None, 0, 0, 0, HashMap::new()), |r| {
                (
                    r.elector.is_leader(),
                    r.elector.is_standby(),
                    Some(r.monitor.current_tier()),
                    r.started_at.elapsed().as_secs(),
                    r.router.len(),
                    r.pairs.len(),
                    r.registry.snapshot(),
                )
            });

        StatusSnapshot {
            state: self.state(),
            instance_id: self.instance_id.clone(),
            region_id: self.config.coordinator.region_id.clone(),
            is_leader,
            is_standby,
            degradation_tier: tier,
            uptime_secs: uptime,
            pending_opportunities: pending,
            active_pairs: pairs,
            services,
            metrics: self.metrics.snapshot(),
        }
    }
}
