//! Error types for the activity chart pipeline.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Whether a failed request is worth retrying as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The same request may succeed later (store hiccup, saturated pool).
    Transient,
    /// The request itself is wrong and will fail again.
    Fatal,
}

/// Errors raised by a cache store.
///
/// These never leave the cache layer: they are logged and turned into misses.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache store unreachable: {0}")]
    Unreachable(String),

    #[error("Cache command failed: {0}")]
    Command(String),

    #[error("Malformed cache entry at '{key}': {message}")]
    Malformed { key: String, message: String },
}

/// Errors reported by an activity repository.
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    #[error("Repository query timed out: {0}")]
    Timeout(String),

    #[error("Repository rejected query: {0}")]
    Rejected(String),
}

impl RepositoryError {
    /// Transient errors are retried with backoff; the rest fail immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RepositoryError::Unavailable(_) | RepositoryError::Timeout(_)
        )
    }
}

/// Errors raised while aggregating activity into a chart series.
#[derive(Debug, Error)]
pub enum AggregationError {
    // === Configuration Errors ===
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Unknown grouping unit: {0}")]
    UnknownGrouping(String),

    #[error("Invalid time range: start {start} is not before end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Invalid parameter value for '{param}': {message}")]
    InvalidParameter { param: String, message: String },

    #[error("Malformed entity set: {0}")]
    MalformedEntitySet(String),

    // === Store Errors ===
    #[error("Store query '{operation}' failed after {attempts} attempt(s): {source}")]
    Store {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: RepositoryError,
    },
}

impl AggregationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AggregationError::Store { source, .. } if source.is_transient() => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Fatal,
        }
    }
}

/// Errors raised while rendering a series into an image.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Render task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: Uuid, timeout: Duration },

    #[error("Render worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Invalid render payload: {0}")]
    InvalidPayload(String),

    #[error("Image encoding failed: {0}")]
    Encode(String),

    #[error("No render worker became available within {0:?}")]
    PoolSaturated(Duration),

    #[error("Failed to spawn render worker: {0}")]
    Spawn(String),

    #[error("Render task cancelled by pool shutdown")]
    Cancelled,

    #[error("Render pool is shutting down")]
    ShuttingDown,
}

impl RenderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RenderError::InvalidPayload(_) | RenderError::Encode(_) => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }
}

/// Unified error surfaced by the pipeline coordinator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Pipeline is shutting down")]
    ShuttingDown,
}

impl PipelineError {
    /// Classification the caller uses to decide whether to retry the request.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::InvalidRequest(_) => ErrorClass::Fatal,
            PipelineError::Aggregation(e) => e.class(),
            PipelineError::Render(e) => e.class(),
            PipelineError::ShuttingDown => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
