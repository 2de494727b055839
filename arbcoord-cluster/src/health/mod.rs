//! Fleet health aggregation, degradation tiers and alerting.

pub mod degradation;
pub mod monitor;
pub mod registry;

pub use degradation::{DegradationTier, ServicePatterns};
pub use monitor::{HealthMonitor, SystemHealthReport};
pub use registry::{HealthRegistry, ServiceHealth, ServiceStatus};
