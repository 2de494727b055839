//! Stream ingestion: consumer groups, rate limiting, envelope
//! normalization and per-stream handlers.

pub mod consumer;
pub mod envelope;
pub mod handlers;
pub mod ratelimit;

pub use consumer::{ConsumerConfig, StreamConsumerManager, StreamHandler};
pub use envelope::Envelope;
pub use ratelimit::RateLimiter;
