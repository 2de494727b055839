//! Leader election over the broker's atomic owned-lock operations.
//!
//! One persistent lock key holds the owning instance id with a TTL. The
//! heartbeat loop renews ownership (or contends for the lock) on a
//! jittered interval so failover attempts do not stampede the broker.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use arbcoord_core::metrics::SystemMetrics;

use crate::alerts::{AlertKind, AlertManager, AlertSeverity};
use crate::broker::{Broker, KvStore};
use crate::error::Result;

/// Consecutive heartbeat failures before a leader self-demotes
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Jitter applied to each heartbeat tick
const HEARTBEAT_JITTER_MS: i64 = 2000;

/// Floor on the jittered interval
const MIN_HEARTBEAT_MS: i64 = 1000;

/// Read-only leadership gate for components that must not forward
/// unless this instance is the leader.
pub trait LeadershipView: Send + Sync {
    fn is_leader(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct ElectorConfig {
    pub lock_key: String,
    pub instance_id: String,
    pub lock_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub is_standby: bool,
    pub can_become_leader: bool,
}

pub struct LeaderElector {
    kv: Arc<dyn Broker>,
    lock_key: String,
    instance_id: String,
    lock_ttl: Duration,
    heartbeat_interval: Duration,
    can_become_leader: bool,
    is_leader: AtomicBool,
    is_standby: AtomicBool,
    /// Set for the duration of a standby activation so the acquisition
    /// path bypasses the standby gate without mutating configuration
    is_activating: AtomicBool,
    consecutive_failures: AtomicU32,
    /// In-flight activation shared by concurrent callers
    activation: tokio::sync::Mutex<Option<Shared<BoxFuture<'static, bool>>>>,
    alerts: Arc<AlertManager>,
    metrics: Arc<SystemMetrics>,
    cancel: CancellationToken,
}

impl LeaderElector {
    #[must_use]
    pub fn new(
        kv: Arc<dyn Broker>,
        config: ElectorConfig,
        alerts: Arc<AlertManager>,
        metrics: Arc<SystemMetrics>,
    ) -> Self {
        Self {
            kv,
            lock_key: config.lock_key,
            instance_id: config.instance_id,
            lock_ttl: config.lock_ttl,
            heartbeat_interval: config.heartbeat_interval,
            can_become_leader: config.can_become_leader,
            is_leader: AtomicBool::new(false),
            is_standby: AtomicBool::new(config.is_standby),
            is_activating: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            activation: tokio::sync::Mutex::new(None),
            alerts,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn is_standby(&self) -> bool {
        self.is_standby.load(Ordering::SeqCst)
    }

    /// Attempt to take (or re-adopt) the leader lock.
    ///
    /// A standby instance refuses unless an activation is in flight.
    /// When `set_if_absent` loses, `renew_if_owned` distinguishes "another
    /// instance leads" from "the lock is already ours" (a restart within
    /// the lock TTL).
    pub async fn try_acquire_leadership(&self) -> Result<bool> {
        if !self.can_become_leader {
            debug!("Instance is not eligible for leadership");
            return Ok(false);
        }
        if self.is_standby.load(Ordering::SeqCst) && !self.is_activating.load(Ordering::SeqCst) {
            debug!("Standby instance, skipping leadership acquisition");
            return Ok(false);
        }

        if self
            .kv
            .set_if_absent(&self.lock_key, &self.instance_id, self.lock_ttl)
            .await?
        {
            self.become_leader(false);
            return Ok(true);
        }

        if self
            .kv
            .renew_if_owned(&self.lock_key, &self.instance_id, self.lock_ttl)
            .await?
        {
            self.become_leader(true);
            return Ok(true);
        }

        Ok(false)
    }

    fn become_leader(&self, recovered: bool) {
        let was_leader = self.is_leader.swap(true, Ordering::SeqCst);
        self.metrics.set_is_leader(true);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if !was_leader {
            if recovered {
                self.metrics.incr_stale_lock_recoveries();
                info!(
                    instance_id = %self.instance_id,
                    "Re-adopted existing leader lock"
                );
            } else {
                info!(instance_id = %self.instance_id, "Acquired leadership");
            }
        }
    }

    fn demote(&self, with_alert: bool, reason: &str) {
        let was_leader = self.is_leader.swap(false, Ordering::SeqCst);
        self.metrics.set_is_leader(false);
        if !was_leader {
            return;
        }
        warn!(instance_id = %self.instance_id, reason = reason, "Lost leadership");
        if with_alert {
            self.alerts.send(
                AlertKind::LeaderDemotion,
                AlertSeverity::Critical,
                None,
                format!("Instance {} self-demoted: {reason}", self.instance_id),
                serde_json::json!({
                    "instanceId": self.instance_id,
                    "reason": reason,
                }),
            );
        }
    }

    /// One heartbeat: leaders renew, followers contend.
    pub(crate) async fn heartbeat_tick(&self) {
        if self.is_leader() {
            match self
                .kv
                .renew_if_owned(&self.lock_key, &self.instance_id, self.lock_ttl)
                .await
            {
                Ok(true) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                }
                Ok(false) => {
                    // Lock expired or was taken over
                    self.demote(false, "lock no longer owned");
                }
                Err(e) => self.on_heartbeat_error(&e.to_string()),
            }
        } else {
            match self.try_acquire_leadership().await {
                Ok(_) => {}
                Err(e) => self.on_heartbeat_error(&e.to_string()),
            }
        }
    }

    fn on_heartbeat_error(&self, error: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            error = %error,
            consecutive_failures = failures,
            "Heartbeat broker call failed"
        );
        if failures >= MAX_CONSECUTIVE_FAILURES && self.is_leader() {
            self.demote(true, "broker unreachable during renewal");
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }
    }

    fn jittered_interval(&self) -> Duration {
        let base = self.heartbeat_interval.as_millis() as i64;
        let jitter = {
            use rand::Rng;
            rand::rng().random_range(-HEARTBEAT_JITTER_MS..=HEARTBEAT_JITTER_MS)
        };
        Duration::from_millis((base + jitter).max(MIN_HEARTBEAT_MS) as u64)
    }

    /// Spawn the heartbeat loop. Stops when `stop()` is called.
    pub fn start_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let cancel = this.cancel.clone();
        tokio::spawn(async move {
            loop {
                let interval = this.jittered_interval();
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("Heartbeat loop stopping");
                        return;
                    }
                    () = tokio::time::sleep(interval) => {}
                }
                this.heartbeat_tick().await;
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Release the lock on clean shutdown. A `false` return means the
    /// lock already expired or moved on, which is not an error.
    pub async fn release(&self) {
        if !self.is_leader() {
            return;
        }
        match self
            .kv
            .release_if_owned(&self.lock_key, &self.instance_id)
            .await
        {
            Ok(true) => info!(instance_id = %self.instance_id, "Released leader lock"),
            Ok(false) => {
                debug!("Leader lock already expired or taken over during release");
            }
            Err(e) => warn!(error = %e, "Failed to release leader lock"),
        }
        self.is_leader.store(false, Ordering::SeqCst);
        self.metrics.set_is_leader(false);
    }

    /// Promote a standby instance.
    ///
    /// Single-flight: concurrent callers share one in-flight attempt and
    /// observe the same result. The standby flag is only cleared after a
    /// successful promotion; a failed attempt leaves configuration
    /// untouched.
    pub async fn activate_standby(self: &Arc<Self>) -> bool {
        let shared = {
            let mut guard = self.activation.lock().await;
            if let Some(in_flight) = guard.as_ref() {
                in_flight.clone()
            } else {
                let this = self.clone();
                let attempt = async move {
                    if !this.is_standby.load(Ordering::SeqCst) {
                        debug!("Activation requested but instance is not standby");
                        return this.is_leader();
                    }

                    this.is_activating.store(true, Ordering::SeqCst);
                    let result = this.try_acquire_leadership().await;
                    this.is_activating.store(false, Ordering::SeqCst);

                    match result {
                        Ok(true) => {
                            this.is_standby.store(false, Ordering::SeqCst);
                            info!(
                                instance_id = %this.instance_id,
                                "Standby activated and promoted to leader"
                            );
                            true
                        }
                        Ok(false) => {
                            warn!("Standby activation did not win the leader lock");
                            false
                        }
                        Err(e) => {
                            error!(error = %e, "Standby activation failed");
                            false
                        }
                    }
                }
                .boxed()
                .shared();
                *guard = Some(attempt.clone());
                attempt
            }
        };

        let result = shared.await;

        let mut guard = self.activation.lock().await;
        *guard = None;
        result
    }
}

impl LeadershipView for LeaderElector {
    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }
}

impl LeaderElector {
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingNotifier;
    use crate::broker::MemoryBroker;

    fn elector_with(
        broker: Arc<MemoryBroker>,
        instance_id: &str,
        standby: bool,
        lock_ttl: Duration,
    ) -> (Arc<LeaderElector>, Arc<RecordingNotifier>) {
        let recorder = Arc::new(RecordingNotifier::new());
        let alerts = Arc::new(AlertManager::new(recorder.clone(), Duration::from_secs(300)));
        let elector = Arc::new(LeaderElector::new(
            broker,
            ElectorConfig {
                lock_key: "coordinator:leader:lock".to_string(),
                instance_id: instance_id.to_string(),
                lock_ttl,
                heartbeat_interval: Duration::from_secs(10),
                is_standby: standby,
                can_become_leader: true,
            },
            alerts,
            Arc::new(SystemMetrics::new()),
        ));
        (elector, recorder)
    }

    #[tokio::test]
    async fn test_first_instance_wins_the_lock() {
        let broker = Arc::new(MemoryBroker::new());
        let (a, _) = elector_with(broker.clone(), "coord-a", false, Duration::from_secs(30));
        let (b, _) = elector_with(broker.clone(), "coord-b", false, Duration::from_secs(30));

        assert!(a.try_acquire_leadership().await.unwrap());
        assert!(!b.try_acquire_leadership().await.unwrap());
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert_eq!(
            broker.kv_get("coordinator:leader:lock").as_deref(),
            Some("coord-a")
        );
    }

    #[tokio::test]
    async fn test_restart_within_ttl_readopts_lock() {
        let broker = Arc::new(MemoryBroker::new());
        let (first, _) = elector_with(broker.clone(), "coord-a", false, Duration::from_secs(30));
        assert!(first.try_acquire_leadership().await.unwrap());

        // Same instance id, fresh process state
        let (restarted, _) =
            elector_with(broker.clone(), "coord-a", false, Duration::from_secs(30));
        assert!(restarted.try_acquire_leadership().await.unwrap());
        assert!(restarted.is_leader());
    }

    #[tokio::test]
    async fn test_leader_handoff_after_ttl_expiry() {
        let broker = Arc::new(MemoryBroker::new());
        let (a, _) = elector_with(broker.clone(), "coord-a", false, Duration::from_millis(60));
        let (b, _) = elector_with(broker.clone(), "coord-b", false, Duration::from_millis(60));

        assert!(a.try_acquire_leadership().await.unwrap());
        assert!(!b.try_acquire_leadership().await.unwrap());

        // A's heartbeat is stuck; the lock expires
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(b.try_acquire_leadership().await.unwrap());
        assert!(b.is_leader());

        // A's next tick observes the loss and demotes without alerting
        a.heartbeat_tick().await;
        assert!(!a.is_leader());

        // Releasing a lock someone else now owns is not an error
        a.release().await;
        assert_eq!(
            broker.kv_get("coordinator:leader:lock").as_deref(),
            Some("coord-b")
        );
    }

    #[tokio::test]
    async fn test_demotion_after_consecutive_broker_failures() {
        let broker = Arc::new(MemoryBroker::new());
        let (a, recorder) = elector_with(broker.clone(), "coord-a", false, Duration::from_secs(30));
        assert!(a.try_acquire_leadership().await.unwrap());

        broker.set_fail_kv(true);
        a.heartbeat_tick().await;
        a.heartbeat_tick().await;
        assert!(a.is_leader());

        a.heartbeat_tick().await;
        assert!(!a.is_leader());
        tokio::task::yield_now().await;
        assert_eq!(recorder.count_of(AlertKind::LeaderDemotion), 1);
    }

    #[tokio::test]
    async fn test_standby_never_contends() {
        let broker = Arc::new(MemoryBroker::new());
        let (standby, _) = elector_with(broker.clone(), "coord-s", true, Duration::from_secs(30));

        assert!(!standby.try_acquire_leadership().await.unwrap());
        assert!(broker.kv_get("coordinator:leader:lock").is_none());
    }

    #[tokio::test]
    async fn test_activation_promotes_standby() {
        let broker = Arc::new(MemoryBroker::new());
        let (standby, _) = elector_with(broker.clone(), "coord-s", true, Duration::from_secs(30));

        assert!(standby.activate_standby().await);
        assert!(standby.is_leader());
        assert!(!standby.is_standby());
    }

    #[tokio::test]
    async fn test_failed_activation_restores_standby() {
        let broker = Arc::new(MemoryBroker::new());
        let (active, _) = elector_with(broker.clone(), "coord-a", false, Duration::from_secs(30));
        assert!(active.try_acquire_leadership().await.unwrap());

        let (standby, _) = elector_with(broker.clone(), "coord-s", true, Duration::from_secs(30));
        assert!(!standby.activate_standby().await);
        assert!(standby.is_standby());
        assert!(!standby.is_leader());
    }

    #[tokio::test]
    async fn test_concurrent_activations_single_flight() {
        let broker = Arc::new(MemoryBroker::new());
        let (standby, _) = elector_with(broker.clone(), "coord-s", true, Duration::from_secs(30));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let elector = standby.clone();
                tokio::spawn(async move { elector.activate_standby().await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in callers {
            results.push(handle.await.unwrap());
        }

        // Every caller observes the same outcome
        assert!(results.iter().all(|&r| r));
        // Exactly one promotion attempt reached the broker
        assert_eq!(broker.kv_op_count(), 1);
    }
}
