pub mod alerts;
pub mod analytics;
pub mod broker;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod health;
pub mod ingest;
pub mod routing;
pub mod streams;

pub use alerts::{
    AlertKind, AlertManager, AlertNotifier, AlertSeverity, NoopNotifier, RecordingNotifier,
    WebhookNotifier,
};
pub use broker::{
    Broker, KvStore, MemoryBroker, PendingEntry, PendingSummary, RedisBroker, StreamBus,
    StreamMessage,
};
pub use coordinator::{Coordinator, Dependencies, LifecycleState, StatusSnapshot};
pub use election::{ElectorConfig, LeaderElector, LeadershipView};
pub use error::{Error, Result};
pub use health::{
    DegradationTier, HealthMonitor, HealthRegistry, ServiceHealth, ServicePatterns, ServiceStatus,
};
pub use ingest::{ConsumerConfig, Envelope, RateLimiter, StreamConsumerManager, StreamHandler};
pub use routing::{IngestOutcome, Opportunity, OpportunityRouter, OpportunityStatus, RouterConfig};
