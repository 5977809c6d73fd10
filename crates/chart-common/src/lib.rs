//! Common types and utilities shared across the activity chart pipeline.

pub mod entity;
pub mod error;
pub mod metric;
pub mod protocol;
pub mod render;
pub mod series;
pub mod time;

pub use entity::{ActivityFilter, ActivityKind, ActivityRecord, EntityId};
pub use error::{
    AggregationError, CacheError, ErrorClass, PipelineError, RenderError, RepositoryError,
};
pub use metric::Metric;
pub use render::{ChartKind, RenderOptions, RenderTask, MAX_DIMENSION};
pub use series::{ChartSeries, Dataset};
pub use time::{normalize_timestamp, GroupingUnit};
