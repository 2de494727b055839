//! Per-stream token bucket with proportional refill.
//!
//! The refill is fractional: elapsed time earns `elapsed / refill_period ×
//! max_tokens` tokens even for sub-period elapses. Discrete whole-period
//! refill starves callers during sub-period bursts.

use dashmap::DashMap;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    max_tokens: f64,
    refill_period: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_tokens: f64, refill_period: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            max_tokens,
            refill_period,
        }
    }

    /// Admit one message for `key` if a whole token is available.
    /// Denied calls do not consume tokens.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.max_tokens,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refill =
            elapsed.as_secs_f64() / self.refill_period.as_secs_f64() * self.max_tokens;
        bucket.tokens = (bucket.tokens + refill).min(self.max_tokens);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Forget all buckets (lifecycle teardown)
    pub fn clear(&self) {
        self.buckets.clear();
    }

    #[cfg(test)]
    fn drain(&self, key: &str) {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.tokens = 0.0;
            bucket.last_refill = Instant::now();
        }
    }

    #[cfg(test)]
    fn backdate(&self, key: &str, by: Duration) {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.last_refill -= by;
        }
    }

    #[cfg(test)]
    fn tokens(&self, key: &str) -> f64 {
        self.buckets.get(key).map_or(0.0, |b| b.tokens)
    }
}
