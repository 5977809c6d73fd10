//! Aggregation engine for activity charts.
//!
//! Turns an entity set and a time range into a [`ChartSeries`]:
//! 1. expand the entity set with related entities (bounded concurrency)
//! 2. fetch raw records once for the expanded set
//! 3. fold records into time buckets, yielding between chunks
//! 4. rank entities by the requested metric and emit gap-filled datasets
//!
//! Every stage reads through the [`storage::ChartCache`].
//!
//! [`ChartSeries`]: chart_common::ChartSeries

pub mod buckets;
pub mod config;
pub mod engine;
pub mod query;
pub mod retry;

pub use buckets::{BucketTable, EntityTotals, TimeBucket};
pub use config::{AggregationConfig, RetryPolicy};
pub use engine::{AggregationEngine, AggregationOutcome};
pub use query::AggregationQuery;
