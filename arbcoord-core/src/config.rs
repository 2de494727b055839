use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub coordinator: CoordinatorConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub alerts: AlertsConfig,
    pub logging: LoggingConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("redis", &self.redis)
            .field("coordinator", &self.coordinator)
            .field("rate_limit", &self.rate_limit)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("alerts", &"<redacted>")
            .field("logging", &self.logging)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Development mode shortens the alert cooldown and uses pretty logs.
    /// WARNING: Never enable in production!
    pub development_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            development_mode: false,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The URL may carry credentials
        f.debug_struct("RedisConfig").field("url", &"<redacted>").finish()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Core coordinator tunables. All durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Redis key holding the leader lock
    pub lock_key: String,
    /// TTL of the leader lock
    pub lock_ttl_ms: u64,
    /// Base interval between heartbeat ticks (jitter is added per tick)
    pub heartbeat_interval_ms: u64,
    /// Consumer group shared by every coordinator instance of a deployment
    pub consumer_group: String,
    /// Explicit consumer identity; generated when empty
    pub consumer_id: String,
    /// A standby instance never contends for leadership until activated
    pub is_standby: bool,
    pub can_become_leader: bool,
    pub region_id: String,
    pub max_opportunities: usize,
    pub opportunity_ttl_ms: u64,
    pub opportunity_cleanup_interval_ms: u64,
    pub pair_ttl_ms: u64,
    /// Suppression window per alert key. 0 selects the environment default
    /// (300 s in production, 30 s in development mode).
    pub alert_cooldown_ms: u64,
    pub enable_legacy_health_polling: bool,
    pub dlq_stream: String,
    pub execution_stream: String,
    /// Pending entries idle longer than this are treated as orphaned
    pub orphan_idle_threshold_ms: u64,
    pub startup_grace_period_ms: u64,
    pub metrics_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Consecutive reader-path errors before a stream failure alert fires
    pub max_stream_errors: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_key: "coordinator:leader:lock".to_string(),
            lock_ttl_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            consumer_group: "coordinator".to_string(),
            consumer_id: String::new(),
            is_standby: false,
            can_become_leader: true,
            region_id: String::new(),
            max_opportunities: 1000,
            opportunity_ttl_ms: 60_000,
            opportunity_cleanup_interval_ms: 10_000,
            pair_ttl_ms: 300_000,
            alert_cooldown_ms: 0,
            enable_legacy_health_polling: false,
            dlq_stream: "stream:dead-letter-queue".to_string(),
            execution_stream: "stream:execution-requests".to_string(),
            orphan_idle_threshold_ms: 60_000,
            startup_grace_period_ms: 60_000,
            metrics_interval_ms: 5_000,
            cleanup_interval_ms: 10_000,
            max_stream_errors: 10,
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn opportunity_ttl(&self) -> Duration {
        Duration::from_millis(self.opportunity_ttl_ms)
    }

    #[must_use]
    pub fn pair_ttl(&self) -> Duration {
        Duration::from_millis(self.pair_ttl_ms)
    }

    #[must_use]
    pub fn orphan_idle_threshold(&self) -> Duration {
        Duration::from_millis(self.orphan_idle_threshold_ms)
    }

    #[must_use]
    pub fn startup_grace_period(&self) -> Duration {
        Duration::from_millis(self.startup_grace_period_ms)
    }

    /// Effective cooldown, resolving 0 to the environment default
    #[must_use]
    pub fn effective_alert_cooldown(&self, development_mode: bool) -> Duration {
        if self.alert_cooldown_ms > 0 {
            Duration::from_millis(self.alert_cooldown_ms)
        } else if development_mode {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(300)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_tokens: f64,
    pub refill_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000.0,
            refill_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub reset_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_ms: 60_000,
        }
    }
}

/// Outbound notification channels. Empty URL disables the channel.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub discord_webhook_url: String,
    pub slack_webhook_url: String,
}

impl std::fmt::Debug for AlertsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertsConfig")
            .field("discord_webhook_url", &"<redacted>")
            .field("slack_webhook_url", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" for production, anything else selects pretty output
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus `ARBCOORD_`-prefixed
    /// environment variables (`ARBCOORD_COORDINATOR__LOCK_TTL_MS=15000`).
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ARBCOORD")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Validate the configuration, collecting every failure.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.redis.url.is_empty() {
            errors.push("redis.url must be set".to_string());
        }
        if self.coordinator.lock_key.is_empty() {
            errors.push("coordinator.lock_key must be set".to_string());
        }
        if self.coordinator.lock_ttl_ms == 0 {
            errors.push("coordinator.lock_ttl_ms must be positive".to_string());
        }
        if self.coordinator.heartbeat_interval_ms == 0 {
            errors.push("coordinator.heartbeat_interval_ms must be positive".to_string());
        }
        if self.coordinator.heartbeat_interval_ms >= self.coordinator.lock_ttl_ms {
            errors.push(format!(
                "coordinator.heartbeat_interval_ms ({}) must be shorter than lock_ttl_ms ({})",
                self.coordinator.heartbeat_interval_ms, self.coordinator.lock_ttl_ms
            ));
        }
        if self.coordinator.consumer_group.is_empty() {
            errors.push("coordinator.consumer_group must be set".to_string());
        }
        if self.coordinator.max_opportunities == 0 {
            errors.push("coordinator.max_opportunities must be positive".to_string());
        }
        if self.coordinator.opportunity_ttl_ms == 0 {
            errors.push("coordinator.opportunity_ttl_ms must be positive".to_string());
        }
        if self.coordinator.dlq_stream.is_empty() {
            errors.push("coordinator.dlq_stream must be set".to_string());
        }
        if self.coordinator.execution_stream.is_empty() {
            errors.push("coordinator.execution_stream must be set".to_string());
        }
        if self.rate_limit.max_tokens < 1.0 {
            errors.push("rate_limit.max_tokens must be at least 1".to_string());
        }
        if self.rate_limit.refill_ms == 0 {
            errors.push("rate_limit.refill_ms must be positive".to_string());
        }
        if self.circuit_breaker.threshold == 0 {
            errors.push("circuit_breaker.threshold must be positive".to_string());
        }
        if self.circuit_breaker.reset_ms < 1000 {
            // failsafe backoff windows start at one second
            errors.push("circuit_breaker.reset_ms must be at least 1000".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.coordinator.lock_ttl_ms, 30_000);
        assert_eq!(config.coordinator.max_opportunities, 1000);
        assert_eq!(config.coordinator.lock_key, "coordinator:leader:lock");
        assert!(!config.coordinator.is_standby);
        assert!(config.coordinator.can_become_leader);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.redis.url = String::new();
        config.coordinator.lock_ttl_ms = 0;

        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 3);
    }

    #[test]
    fn test_heartbeat_must_undercut_lock_ttl() {
        let mut config = Config::default();
        config.coordinator.heartbeat_interval_ms = 30_000;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("heartbeat_interval_ms")));
    }

    #[test]
    fn test_effective_alert_cooldown() {
        let coordinator = CoordinatorConfig::default();
        assert_eq!(
            coordinator.effective_alert_cooldown(false),
            Duration::from_secs(300)
        );
        assert_eq!(
            coordinator.effective_alert_cooldown(true),
            Duration::from_secs(30)
        );

        let explicit = CoordinatorConfig {
            alert_cooldown_ms: 1234,
            ..CoordinatorConfig::default()
        };
        assert_eq!(
            explicit.effective_alert_cooldown(false),
            Duration::from_millis(1234)
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::default();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("redis://"));
        assert!(rendered.contains("<redacted>"));
    }
}
