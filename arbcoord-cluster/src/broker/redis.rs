//! Redis-backed broker adapter.
//!
//! Leader-lock mutations go through server-side Lua scripts so the
//! check-and-act is a single atomic step. Stream verbs map onto consumer
//! groups, XACK/XADD/XPENDING/XCLAIM. Every call is raced against a fixed
//! operation timeout.

use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamMaxlen, StreamPendingCountReply, StreamPendingReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client as RedisClient};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;

use arbcoord_core::resilience::timeout::BROKER_OPERATION_TIMEOUT;

use super::{KvStore, PendingEntry, PendingSummary, StreamBus, StreamMessage};
use crate::error::{Error, Result};

/// Atomic check-and-extend: refresh the TTL only while we still own the key
const RENEW_IF_OWNED_SCRIPT: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    else
        return 0
    end
";

/// Atomic check-and-delete: release only while we still own the key
const RELEASE_IF_OWNED_SCRIPT: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    else
        return 0
    end
";

pub struct RedisBroker {
    client: RedisClient,
    /// Cached multiplexed connection, reused across operations.
    /// `MultiplexedConnection` handles concurrent requests internally and
    /// reconnects automatically.
    cached_conn: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    renew_script: redis::Script,
    release_script: redis::Script,
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Failed to create Redis client: {e}")))?;

        Ok(Self {
            client,
            cached_conn: tokio::sync::Mutex::new(None),
            renew_script: redis::Script::new(RENEW_IF_OWNED_SCRIPT),
            release_script: redis::Script::new(RELEASE_IF_OWNED_SCRIPT),
        })
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.cached_conn.lock().await;
        if let Some(ref conn) = *guard {
            return Ok(conn.clone());
        }
        let conn = timeout(
            BROKER_OPERATION_TIMEOUT,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))?
        .map_err(map_redis_err)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

fn map_redis_err(e: redis::RedisError) -> Error {
    if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped() {
        Error::BrokerUnavailable(e.to_string())
    } else {
        Error::BrokerProtocol(e.to_string())
    }
}

fn fields_from_map(map: HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.into_iter()
        .filter_map(|(k, v)| redis::from_redis_value::<String>(v).ok().map(|v| (k, v)))
        .collect()
}

#[async_trait]
impl KvStore for RedisBroker {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_conn().await?;

        let reply: Option<String> = timeout(
            BROKER_OPERATION_TIMEOUT,
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis SET NX timed out".to_string()))?
        .map_err(map_redis_err)?;

        Ok(reply.is_some())
    }

    async fn renew_if_owned(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_conn().await?;

        let renewed: i64 = timeout(
            BROKER_OPERATION_TIMEOUT,
            self.renew_script
                .key(key)
                .arg(value)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis renew script timed out".to_string()))?
        .map_err(map_redis_err)?;

        Ok(renewed == 1)
    }

    async fn release_if_owned(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;

        let released: i64 = timeout(
            BROKER_OPERATION_TIMEOUT,
            self.release_script
                .key(key)
                .arg(value)
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis release script timed out".to_string()))?
        .map_err(map_redis_err)?;

        Ok(released == 1)
    }

    async fn disconnect(&self) {
        // Dropping the cached handle closes the multiplexed connection
        let mut guard = self.cached_conn.lock().await;
        *guard = None;
    }
}

#[async_trait]
impl StreamBus for RedisBroker {
    async fn create_group(&self, stream: &str, group: &str, start_from: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;

        let result: std::result::Result<(), redis::RedisError> = timeout(
            BROKER_OPERATION_TIMEOUT,
            conn.xgroup_create_mkstream(stream, group, start_from),
        )
        .await
        .map_err(|_| Error::Timeout("Redis XGROUP CREATE timed out".to_string()))?;

        match result {
            Ok(()) => Ok(()),
            // The group surviving a restart is the normal case
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_err(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let mut conn = self.get_conn().await?;

        let options = StreamReadOptions::default()
            .group(group, consumer)
            .block(block.as_millis() as usize)
            .count(count);

        // Outer timeout must exceed the blocking window
        let op_timeout = BROKER_OPERATION_TIMEOUT + block;
        let reply: StreamReadReply = timeout(
            op_timeout,
            conn.xread_options(&[stream], &[">"], &options),
        )
        .await
        .map_err(|_| Error::Timeout("Redis XREADGROUP timed out".to_string()))?
        .map_err(map_redis_err)?;

        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                messages.push(StreamMessage {
                    id: entry.id,
                    fields: fields_from_map(entry.map),
                });
            }
        }
        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;

        let _acked: i64 = timeout(
            BROKER_OPERATION_TIMEOUT,
            conn.xack(stream, group, &[id]),
        )
        .await
        .map_err(|_| Error::Timeout("Redis XACK timed out".to_string()))?
        .map_err(map_redis_err)?;

        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.get_conn().await?;

        let id: String = timeout(
            BROKER_OPERATION_TIMEOUT,
            conn.xadd(stream, "*", fields),
        )
        .await
        .map_err(|_| Error::Timeout("Redis XADD timed out".to_string()))?
        .map_err(map_redis_err)?;

        Ok(id)
    }

    async fn append_capped(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: usize,
    ) -> Result<String> {
        let mut conn = self.get_conn().await?;

        let id: String = timeout(
            BROKER_OPERATION_TIMEOUT,
            conn.xadd_maxlen(stream, StreamMaxlen::Approx(max_len), "*", fields),
        )
        .await
        .map_err(|_| Error::Timeout("Redis XADD MAXLEN timed out".to_string()))?
        .map_err(map_redis_err)?;

        Ok(id)
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> Result<PendingSummary> {
        let mut conn = self.get_conn().await?;

        let reply: StreamPendingReply = timeout(
            BROKER_OPERATION_TIMEOUT,
            conn.xpending(stream, group),
        )
        .await
        .map_err(|_| Error::Timeout("Redis XPENDING timed out".to_string()))?
        .map_err(map_redis_err)?;

        match reply {
            StreamPendingReply::Empty => Ok(PendingSummary::default()),
            StreamPendingReply::Data(data) => Ok(PendingSummary {
                total: data.count as u64,
                min_id: Some(data.start_id),
                max_id: Some(data.end_id),
                consumers: data
                    .consumers
                    .into_iter()
                    .map(|c| (c.name, c.pending as u64))
                    .collect(),
            }),
            _ => unreachable!("StreamPendingReply has only Empty and Data variants"),
        }
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        from: &str,
        to: &str,
        limit: usize,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.get_conn().await?;

        let reply: StreamPendingCountReply = if let Some(consumer) = consumer {
            timeout(
                BROKER_OPERATION_TIMEOUT,
                conn.xpending_consumer_count(stream, group, from, to, limit, consumer),
            )
            .await
            .map_err(|_| Error::Timeout("Redis XPENDING range timed out".to_string()))?
            .map_err(map_redis_err)?
        } else {
            timeout(
                BROKER_OPERATION_TIMEOUT,
                conn.xpending_count(stream, group, from, to, limit),
            )
            .await
            .map_err(|_| Error::Timeout("Redis XPENDING range timed out".to_string()))?
            .map_err(map_redis_err)?
        };

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.get_conn().await?;

        let reply: StreamClaimReply = timeout(
            BROKER_OPERATION_TIMEOUT,
            conn.xclaim(
                stream,
                group,
                new_consumer,
                min_idle.as_millis() as usize,
                ids,
            ),
        )
        .await
        .map_err(|_| Error::Timeout("Redis XCLAIM timed out".to_string()))?
        .map_err(map_redis_err)?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| StreamMessage {
                id: entry.id,
                fields: fields_from_map(entry.map),
            })
            .collect())
    }
}
