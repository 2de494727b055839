//! Error types for the coordinator core

use thiserror::Error;

/// Coordinator error types
#[derive(Debug, Error)]
pub enum Error {
    /// Transient broker failure; callers skip and retry on the next tick
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Non-retryable broker response (malformed reply, bad command)
    #[error("Broker protocol error: {0}")]
    BrokerProtocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Whether the caller may retry the operation on a later tick
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_) | Self::Timeout(_))
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::BrokerUnavailable("connection refused".into()).is_retryable());
        assert!(Error::Timeout("read timed out".into()).is_retryable());
        assert!(!Error::BrokerProtocol("WRONGTYPE".into()).is_retryable());
        assert!(!Error::Configuration("missing lock key".into()).is_retryable());
    }
}
