//! Aggregation engine configuration.

use std::time::Duration;

/// Retry behaviour for transient repository errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry (doubles each retry)
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Configuration for the aggregation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationConfig {
    /// Entities per related-entity expansion batch
    pub expansion_batch_size: usize,
    /// Expansion batches allowed in flight at once
    pub max_concurrent_batches: usize,
    /// Records folded between cooperative yields
    pub reduce_chunk_size: usize,
    /// Largest number of time buckets one query may span
    pub max_buckets: usize,
    pub retry: RetryPolicy,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            expansion_batch_size: 50,
            max_concurrent_batches: 4,
            reduce_chunk_size: 5_000,
            max_buckets: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}
