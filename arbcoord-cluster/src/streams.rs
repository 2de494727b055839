//! Stream names shared between the coordinator and its collaborators.

/// Fleet health reports (consumed) and coordinator self-reports (produced)
pub const HEALTH: &str = "stream:health";

/// Detected arbitrage opportunities from the detector fleet
pub const OPPORTUNITIES: &str = "stream:opportunities";

/// Large-transfer notifications
pub const WHALE_ALERTS: &str = "stream:whale-alerts";

/// Raw swap events (wrapped envelopes)
pub const SWAP_EVENTS: &str = "stream:swap-events";

/// Windowed volume aggregates (wrapped envelopes)
pub const VOLUME_AGGREGATES: &str = "stream:volume-aggregates";

/// Per-pair price ticks (wrapped envelopes)
pub const PRICE_UPDATES: &str = "stream:price-updates";

/// Outcomes reported by the execution engine
pub const EXECUTION_RESULTS: &str = "stream:execution-results";

/// Execution requests forwarded by the leader (produced)
pub const EXECUTION_REQUESTS: &str = "stream:execution-requests";

/// Dead-letter queue for failed and orphaned messages (produced)
pub const DEAD_LETTER_QUEUE: &str = "stream:dead-letter-queue";

/// Streams the consumer manager subscribes to
pub const CONSUMED: &[&str] = &[
    HEALTH,
    OPPORTUNITIES,
    WHALE_ALERTS,
    SWAP_EVENTS,
    VOLUME_AGGREGATES,
    PRICE_UPDATES,
    EXECUTION_RESULTS,
];

/// Approximate cap applied to produced streams
pub const PRODUCED_STREAM_MAXLEN: usize = 10_000;
