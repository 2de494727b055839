//! Resilience primitives shared across the coordinator.
//!
//! Timeout bounds for broker and webhook calls, plus construction of the
//! `failsafe` circuit breaker guarding the execution stream.

pub mod timeout {
    //! Timeout configuration for external calls

    use std::time::Duration;

    /// Bound on every broker (Redis) operation
    pub const BROKER_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Bound on broker disconnect during shutdown
    pub const BROKER_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Bound on outbound webhook notification requests
    pub const WEBHOOK_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Bound on stopping a reader or interval task before force-abort
    pub const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
}

pub mod circuit_breaker {
    //! Circuit breaker for downstream streams
    //!
    //! Uses the `failsafe` crate. The breaker opens after `threshold`
    //! consecutive failures and stays open for a fixed `reset` window, then
    //! admits a single half-open probe.

    use std::time::Duration;

    pub use failsafe::CircuitBreaker;

    pub type ExecutionBreaker = failsafe::StateMachine<
        failsafe::failure_policy::ConsecutiveFailures<failsafe::backoff::Exponential>,
        (),
    >;

    /// Create a breaker with a fixed open window.
    ///
    /// `reset` must be at least one second (failsafe backoff floor).
    pub fn create(threshold: u32, reset: Duration) -> ExecutionBreaker {
        // Equal min/max collapses the exponential schedule to a constant window
        let backoff = failsafe::backoff::exponential(reset, reset);
        let policy = failsafe::failure_policy::consecutive_failures(threshold, backoff);
        failsafe::Config::new().failure_policy(policy).build()
    }
}

#[cfg(test)]
mod tests {
    use super::circuit_breaker;
    use failsafe::CircuitBreaker;
    use std::time::Duration;

    #[test]
    fn test_breaker_opens_on_threshold() {
        let cb = circuit_breaker::create(3, Duration::from_secs(60));

        assert!(cb.is_call_permitted());
        for _ in 0..3 {
            cb.on_error();
        }
        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn test_breaker_success_resets_consecutive_count() {
        let cb = circuit_breaker::create(3, Duration::from_secs(60));

        cb.on_error();
        cb.on_error();
        cb.on_success();
        cb.on_error();
        cb.on_error();

        // Never hit three in a row
        assert!(cb.is_call_permitted());
    }

    #[test]
    fn test_breaker_half_open_probe() {
        // failsafe requires backoff windows of at least one second
        let cb = circuit_breaker::create(2, Duration::from_secs(1));

        cb.on_error();
        cb.on_error();
        assert!(!cb.is_call_permitted());

        std::thread::sleep(Duration::from_millis(1500));

        // Half-open admits a probe; success closes the breaker
        assert!(cb.is_call_permitted());
        cb.on_success();
        assert!(cb.is_call_permitted());
    }
}
