//! Exponential backoff around repository calls.

use std::future::Future;

use tracing::warn;

use chart_common::{AggregationError, RepositoryError};

use crate::config::RetryPolicy;

/// Run `call` until it succeeds, fails fatally, or exhausts `policy`.
///
/// Only transient repository errors are retried. The returned error records
/// how many attempts were made.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, AggregationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RepositoryError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    operation = operation,
                    error = %e,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Store query failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(source) => {
                return Err(AggregationError::Store {
                    operation,
                    attempts: attempt,
                    source,
                })
            }
        }
    }
}
