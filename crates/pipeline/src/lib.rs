//! Chart pipeline: render worker pool and the request coordinator.
//!
//! The coordinator ties the cache layer, the aggregation engine and the
//! render pool together. Workers run either as separate processes speaking the
//! framed protocol ([`process`]) or as dedicated threads ([`thread`]).

pub mod config;
pub mod coordinator;
pub mod pool;
pub mod process;
pub mod request;
pub mod stats;
pub mod thread;
pub mod worker;

pub use config::{ConfigError, PipelineConfig, PoolConfig};
pub use coordinator::{ChartPipeline, InvalidationScope};
pub use pool::{PoolStats, RenderPool};
pub use process::ProcessWorkerFactory;
pub use request::{with_request_defaults, ChartRequest, RawChartParams, RequestDefaults, DEFAULT_LIMIT};
pub use stats::{MemoryStats, PipelineMetrics};
pub use thread::{RenderFn, ThreadWorkerFactory};
pub use worker::{RenderWorker, WorkerFactory, WorkerFault};
