//! Consumer-group ingestion with deferred ack, orphan recovery and a
//! dead-letter queue.
//!
//! Delivery is at-least-once: handlers must be idempotent. The manager
//! never retries in-process; redelivery happens through the broker until
//! an ack (possibly after a DLQ copy) terminates the message lifecycle.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use arbcoord_core::metrics::SystemMetrics;
use arbcoord_core::resilience::timeout::TASK_SHUTDOWN_TIMEOUT;

use super::envelope::Envelope;
use super::ratelimit::RateLimiter;
use crate::alerts::{AlertKind, AlertManager, AlertSeverity};
use crate::broker::{Broker, StreamBus, StreamMessage};
use crate::error::Result;

/// Pending entries fetched per consumer during orphan recovery
const ORPHAN_SCAN_LIMIT: usize = 100;

/// Truncation bound for the DLQ error detail field
const ERROR_DETAIL_LIMIT: usize = 500;

/// Pause after a failed read before the next attempt
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Per-stream message handler. Returning an error routes the message to
/// the dead-letter queue; it is acked either way.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: String,
    pub consumer_id: String,
    pub dlq_stream: String,
    pub orphan_idle_threshold: Duration,
    /// Reader-path errors before the stream failure alert fires
    pub max_stream_errors: u64,
    pub read_batch: usize,
    pub read_block: Duration,
}

impl ConsumerConfig {
    #[must_use]
    pub fn new(group: &str, consumer_id: &str, dlq_stream: &str) -> Self {
        Self {
            group: group.to_string(),
            consumer_id: consumer_id.to_string(),
            dlq_stream: dlq_stream.to_string(),
            orphan_idle_threshold: Duration::from_secs(60),
            max_stream_errors: 10,
            read_batch: 10,
            read_block: Duration::from_secs(1),
        }
    }
}

pub struct StreamConsumerManager {
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    handlers: Mutex<Vec<(String, Arc<dyn StreamHandler>)>>,
    rate_limiter: Arc<RateLimiter>,
    alerts: Arc<AlertManager>,
    metrics: Arc<SystemMetrics>,
    error_count: AtomicU64,
    /// Set before the async alert send so concurrent burst triggers
    /// collapse to a single alert
    sending_error_alert: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl StreamConsumerManager {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        config: ConsumerConfig,
        rate_limiter: Arc<RateLimiter>,
        alerts: Arc<AlertManager>,
        metrics: Arc<SystemMetrics>,
    ) -> Self {
        Self {
            broker,
            config,
            handlers: Mutex::new(Vec::new()),
            rate_limiter,
            alerts,
            metrics,
            error_count: AtomicU64::new(0),
            sending_error_alert: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register the handler for one stream. Must happen before `prepare`.
    pub fn register(&self, stream: &str, handler: Arc<dyn StreamHandler>) {
        self.handlers.lock().push((stream.to_string(), handler));
    }

    fn subscribed_streams(&self) -> Vec<String> {
        self.handlers.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    /// Create groups (idempotent) and recover orphaned pending entries
    /// left behind by crashed peers.
    pub async fn prepare(&self) -> Result<()> {
        for stream in self.subscribed_streams() {
            self.broker
                .create_group(&stream, &self.config.group, "$")
                .await?;

            match self.recover_orphans(&stream).await {
                Ok(0) => {}
                Ok(recovered) => {
                    info!(
                        stream = %stream,
                        recovered = recovered,
                        "Recovered orphaned pending messages"
                    );
                }
                Err(e) if e.is_retryable() => {
                    debug!(stream = %stream, error = %e, "Orphan recovery skipped, broker unavailable");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Claim foreign pending entries idle beyond the orphan threshold,
    /// archive each to the DLQ and ack the original.
    async fn recover_orphans(&self, stream: &str) -> Result<usize> {
        let summary = self
            .broker
            .pending_summary(stream, &self.config.group)
            .await?;
        if summary.total == 0 {
            return Ok(0);
        }

        let mut recovered = 0usize;
        for (consumer, pending) in &summary.consumers {
            if *pending == 0 {
                continue;
            }
            if consumer == &self.config.consumer_id {
                info!(
                    stream = %stream,
                    pending = pending,
                    "Own pending entries will be redelivered by the broker"
                );
                continue;
            }

            let entries = self
                .broker
                .pending_range(
                    stream,
                    &self.config.group,
                    "-",
                    "+",
                    ORPHAN_SCAN_LIMIT,
                    Some(consumer),
                )
                .await?;

            let orphaned: Vec<String> = entries
                .iter()
                .filter(|e| e.idle >= self.config.orphan_idle_threshold)
                .map(|e| e.id.clone())
                .collect();
            if orphaned.is_empty() {
                debug!(
                    stream = %stream,
                    consumer = %consumer,
                    "Peer has pending entries below the idle threshold"
                );
                continue;
            }

            let claimed = self
                .broker
                .claim(
                    stream,
                    &self.config.group,
                    &self.config.consumer_id,
                    self.config.orphan_idle_threshold,
                    &orphaned,
                )
                .await?;

            for message in claimed {
                let fields = vec![
                    ("originalStream".to_string(), stream.to_string()),
                    ("originalId".to_string(), message.id.clone()),
                    (
                        "data".to_string(),
                        serde_json::to_string(&message.fields).unwrap_or_else(|_| "{}".to_string()),
                    ),
                    (
                        "error".to_string(),
                        "Orphaned PEL message recovered".to_string(),
                    ),
                    (
                        "timestamp".to_string(),
                        Utc::now().timestamp_millis().to_string(),
                    ),
                ];
                match self.broker.append(&self.config.dlq_stream, &fields).await {
                    Ok(_) => self.metrics.incr_dlq_writes(),
                    Err(e) => {
                        warn!(
                            stream = %stream,
                            original_id = %message.id,
                            error = %e,
                            "Failed to archive orphan to the DLQ"
                        );
                    }
                }
                self.broker
                    .ack(stream, &self.config.group, &message.id)
                    .await?;
                self.metrics.incr_stream_recoveries();
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Spawn one reader task per registered stream.
    pub fn start_readers(self: &Arc<Self>) {
        let handlers: Vec<(String, Arc<dyn StreamHandler>)> = self.handlers.lock().clone();
        let mut tasks = self.tasks.lock();
        for (stream, handler) in handlers {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                this.run_reader(stream, handler).await;
            }));
        }
    }

    async fn run_reader(self: Arc<Self>, stream: String, handler: Arc<dyn StreamHandler>) {
        info!(stream = %stream, consumer = %self.config.consumer_id, "Stream reader started");
        loop {
            let read = tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(stream = %stream, "Stream reader stopping");
                    return;
                }
                read = self.broker.read_group(
                    &stream,
                    &self.config.group,
                    &self.config.consumer_id,
                    self.config.read_block,
                    self.config.read_batch,
                ) => read,
            };

            match read {
                Ok(batch) => {
                    for message in batch {
                        self.process_message(&stream, handler.as_ref(), message).await;
                    }
                }
                Err(e) => {
                    self.record_error(&stream);
                    if e.is_retryable() {
                        debug!(stream = %stream, error = %e, "Stream read failed, retrying");
                    } else {
                        error!(stream = %stream, error = %e, "Stream read failed");
                    }
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// Deliver one message with deferred ack: handler success acks and
    /// resets the error burst; handler failure archives to the DLQ and
    /// still acks so the broker does not redeliver forever.
    async fn process_message(
        &self,
        stream: &str,
        handler: &dyn StreamHandler,
        message: StreamMessage,
    ) {
        if !self.rate_limiter.check(stream) {
            warn!(stream = %stream, message_id = %message.id, "Message dropped by rate limiter");
            self.metrics.incr_rate_limited();
            // No ack: the broker redelivers once the bucket refills
            return;
        }

        let envelope = Envelope::normalize(&message);
        match handler.handle(&envelope).await {
            Ok(()) => {
                if let Err(e) = self
                    .broker
                    .ack(stream, &self.config.group, &message.id)
                    .await
                {
                    warn!(stream = %stream, message_id = %message.id, error = %e, "Ack failed");
                    self.record_error(stream);
                } else {
                    self.reset_errors(stream);
                }
            }
            Err(handler_err) => {
                self.record_error(stream);
                error!(
                    stream = %stream,
                    message_id = %message.id,
                    error = %handler_err,
                    "Handler failed, archiving message to the DLQ"
                );
                self.archive_failure(stream, &message, &handler_err).await;
                if let Err(e) = self
                    .broker
                    .ack(stream, &self.config.group, &message.id)
                    .await
                {
                    warn!(stream = %stream, message_id = %message.id, error = %e, "Ack failed after DLQ write");
                }
            }
        }
    }

    async fn archive_failure(&self, stream: &str, message: &StreamMessage, err: &anyhow::Error) {
        let mut detail = format!("{err:?}");
        if detail.len() > ERROR_DETAIL_LIMIT {
            let mut cut = ERROR_DETAIL_LIMIT;
            while !detail.is_char_boundary(cut) {
                cut -= 1;
            }
            detail.truncate(cut);
        }

        let fields = vec![
            ("originalStream".to_string(), stream.to_string()),
            ("originalId".to_string(), message.id.clone()),
            (
                "data".to_string(),
                serde_json::to_string(&message.fields).unwrap_or_else(|_| "{}".to_string()),
            ),
            ("error".to_string(), format!("{err:#}")),
            ("errorStack".to_string(), detail),
            (
                "timestamp".to_string(),
                Utc::now().timestamp_millis().to_string(),
            ),
            ("service".to_string(), "coordinator".to_string()),
            ("instanceId".to_string(), self.config.consumer_id.clone()),
        ];

        match self.broker.append(&self.config.dlq_stream, &fields).await {
            Ok(_) => self.metrics.incr_dlq_writes(),
            // Prefer moving on over a redelivery storm: the original is
            // acked even when the DLQ copy is lost
            Err(e) => {
                warn!(
                    stream = %stream,
                    message_id = %message.id,
                    error = %e,
                    "DLQ write failed, message will be acked without archive"
                );
            }
        }
    }

    fn record_error(&self, stream: &str) {
        self.metrics.incr_stream_errors();
        let count = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.max_stream_errors
            && !self.sending_error_alert.swap(true, Ordering::SeqCst)
        {
            self.alerts.send(
                AlertKind::StreamConsumerFailure,
                AlertSeverity::Critical,
                None,
                format!("Stream consumer error burst on {stream}"),
                serde_json::json!({
                    "streamName": stream,
                    "errorCount": count,
                }),
            );
        }
    }

    fn reset_errors(&self, stream: &str) {
        let previous = self.error_count.swap(0, Ordering::SeqCst);
        if previous >= self.config.max_stream_errors {
            self.sending_error_alert.store(false, Ordering::SeqCst);
            self.alerts.send(
                AlertKind::StreamRecovered,
                AlertSeverity::High,
                None,
                format!("Stream consumer recovered on {stream}"),
                serde_json::json!({
                    "streamName": stream,
                    "clearedErrors": previous,
                }),
            );
        }
    }

    /// Stop all readers, force-aborting any that outlive the shutdown
    /// timeout. Also resets the error burst state.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<tokio::task::JoinHandle<()>> = {
            let mut tasks = self.tasks.lock();
            tasks.drain(..).collect()
        };
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, handle)
                .await
                .is_err()
            {
                warn!("Stream reader did not stop in time, aborting");
                abort.abort();
            }
        }
        self.error_count.store(0, Ordering::SeqCst);
        self.sending_error_alert.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }
}
