//! Graceful-degradation tiers.
//!
//! The evaluator is a pure function of the health snapshot so the same
//! inputs always produce the same tier.

use serde::Serialize;
use std::collections::HashMap;

use super::registry::{ServiceHealth, ServiceStatus};

/// Capability tier given current fleet health, best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationTier {
    FullOperation,
    ReducedChains,
    DetectionOnly,
    ReadOnly,
    CompleteOutage,
}

impl DegradationTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullOperation => "FULL_OPERATION",
            Self::ReducedChains => "REDUCED_CHAINS",
            Self::DetectionOnly => "DETECTION_ONLY",
            Self::ReadOnly => "READ_ONLY",
            Self::CompleteOutage => "COMPLETE_OUTAGE",
        }
    }
}

/// Service-class membership patterns
#[derive(Debug, Clone)]
pub struct ServicePatterns {
    /// Exact name of the execution engine service
    pub execution_engine: String,
    /// Substring identifying detector services
    pub detector: String,
}

impl Default for ServicePatterns {
    fn default() -> Self {
        Self {
            execution_engine: "EXECUTION_ENGINE".to_string(),
            detector: "detector".to_string(),
        }
    }
}

impl ServicePatterns {
    #[must_use]
    pub fn is_executor(&self, name: &str) -> bool {
        name == self.execution_engine
    }

    #[must_use]
    pub fn is_detector(&self, name: &str) -> bool {
        name.contains(&self.detector)
    }
}

/// Evaluate the degradation tier for a health snapshot.
#[must_use]
pub fn evaluate(
    services: &HashMap<String, ServiceHealth>,
    patterns: &ServicePatterns,
) -> DegradationTier {
    if services.is_empty() {
        return DegradationTier::CompleteOutage;
    }

    let healthy = services
        .values()
        .filter(|s| s.status == ServiceStatus::Healthy)
        .count();
    if healthy == 0 {
        return DegradationTier::CompleteOutage;
    }

    let executor_healthy = services
        .values()
        .any(|s| patterns.is_executor(&s.name) && s.status == ServiceStatus::Healthy);

    let detectors: Vec<&ServiceHealth> = services
        .values()
        .filter(|s| patterns.is_detector(&s.name))
        .collect();
    let healthy_detectors = detectors
        .iter()
        .filter(|s| s.status == ServiceStatus::Healthy)
        .count();
    let all_detectors_healthy = !detectors.is_empty() && healthy_detectors == detectors.len();

    match (executor_healthy, healthy_detectors) {
        (true, n) if n > 0 && all_detectors_healthy => DegradationTier::FullOperation,
        (true, n) if n > 0 => DegradationTier::ReducedChains,
        (true, _) => DegradationTier::ReducedChains,
        (false, n) if n > 0 => DegradationTier::DetectionOnly,
        (false, _) => DegradationTier::ReadOnly,
    }
}
