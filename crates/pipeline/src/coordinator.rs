//! The chart pipeline coordinator.
//!
//! Per request: rendered-image cache, then series cache, then aggregation,
//! then the render pool. Both cached stages are written inline before the
//! request returns.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use aggregation::AggregationEngine;
use chart_common::{ChartSeries, EntityId, PipelineError};
use storage::{ActivityRepository, CacheStore, ChartCache, KeyDeriver, Namespace};

use crate::config::PipelineConfig;
use crate::pool::RenderPool;
use crate::request::ChartRequest;
use crate::stats::{MemoryStats, PipelineCounters, PipelineMetrics};
use crate::worker::WorkerFactory;

/// How long shutdown waits for cancelled requests to unwind.
const UNWIND_GRACE: Duration = Duration::from_secs(1);

/// What an invalidation removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    /// Entries derived from any of these entities (requested or related).
    Entities(Vec<EntityId>),
    /// Entries whose time span overlaps `[start, end)`.
    TimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    All,
}

/// Series cache value: the series plus the expanded entity set it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedSeries {
    series: ChartSeries,
    entities: Vec<EntityId>,
}

/// Tracks requests in flight and stops admitting new ones on shutdown.
#[derive(Debug, Default)]
struct Admission {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

struct Admitted<'a> {
    admission: &'a Admission,
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        if self.admission.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.admission.idle.notify_waiters();
        }
    }
}

impl Admission {
    fn enter(&self) -> Result<Admitted<'_>, PipelineError> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let admitted = Admitted { admission: self };
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::ShuttingDown);
        }
        Ok(admitted)
    }

    /// Stop admitting. Returns false when already closed.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until nothing is in flight. Returns false on timeout.
    async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

/// Orchestrates caching, aggregation and rendering.
pub struct ChartPipeline {
    cache: Arc<ChartCache>,
    engine: Arc<AggregationEngine>,
    pool: RenderPool,
    drain_timeout: Duration,
    counters: PipelineCounters,
    admission: Admission,
}

impl ChartPipeline {
    /// Assemble a pipeline from services that are already running.
    pub fn new(cache: Arc<ChartCache>, engine: Arc<AggregationEngine>, pool: RenderPool, drain_timeout: Duration) -> Self {
        Self {
            cache,
            engine,
            pool,
            drain_timeout,
            counters: PipelineCounters::default(),
            admission: Admission::default(),
        }
    }

    /// Build the cache, engine and worker pool from `config`.
    pub async fn start(
        config: PipelineConfig,
        store: Arc<dyn CacheStore>,
        repository: Arc<dyn ActivityRepository>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Result<Self, PipelineError> {
        let cache = Arc::new(ChartCache::new(
            store,
            KeyDeriver::new(config.cache_prefix.clone()),
            config.ttl.clone(),
        ));
        let engine = Arc::new(AggregationEngine::new(repository, Arc::clone(&cache), config.aggregation.clone()));
        let pool = RenderPool::start(factory, config.pool.clone()).await?;

        info!(
            cache_prefix = %config.cache_prefix,
            pool_size = pool.size(),
            "Chart pipeline started"
        );
        Ok(Self::new(cache, engine, pool, config.drain_timeout))
    }

    pub fn cache(&self) -> &Arc<ChartCache> {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &RenderPool {
        &self.pool
    }

    /// Produce the image for `request`.
    #[instrument(
        skip(self, request),
        fields(
            entities = request.entity_ids.len(),
            grouping = %request.grouping,
            metric = %request.metric,
            kind = %request.render.kind
        )
    )]
    pub async fn get_chart(&self, request: &ChartRequest) -> Result<Bytes, PipelineError> {
        let _admitted = self.admission.enter()?;
        let started = Instant::now();
        PipelineCounters::incr(&self.counters.requests);
        counter!("chart_requests_total").increment(1);

        let result = self.serve(request).await;

        histogram!("chart_request_duration_seconds").record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            PipelineCounters::incr(&self.counters.failures);
            let class = if e.is_retryable() { "transient" } else { "fatal" };
            counter!("chart_request_failures_total", "class" => class).increment(1);
            warn!(error = %e, retryable = e.is_retryable(), "Chart request failed");
        }
        result
    }

    async fn serve(&self, request: &ChartRequest) -> Result<Bytes, PipelineError> {
        request.validate()?;

        let image_key = self.cache.derive(Namespace::RenderedImage, &request.image_params());
        if let Some(image) = self.cache.get_bytes(&image_key).await {
            PipelineCounters::incr(&self.counters.image_hits);
            counter!("chart_request_source_total", "source" => "image_cache").increment(1);
            debug!(key = %image_key, bytes = image.len(), "Served chart from image cache");
            return Ok(image);
        }

        let series_key = self.cache.derive(Namespace::Series, &request.series_params());
        let cached = match self.cache.get_json::<CachedSeries>(&series_key).await {
            Some(cached) => {
                PipelineCounters::incr(&self.counters.series_hits);
                counter!("chart_request_source_total", "source" => "series_cache").increment(1);
                cached
            }
            None => {
                let outcome = self.engine.aggregate_detailed(&request.query()).await?;
                PipelineCounters::incr(&self.counters.aggregations);
                counter!("chart_request_source_total", "source" => "aggregation").increment(1);

                let cached = CachedSeries {
                    series: outcome.series,
                    entities: outcome.entities,
                };
                let key = series_key.with_tags(cached.entities.iter().cloned());
                self.cache.set_json(&key, &cached).await;
                cached
            }
        };

        let CachedSeries { series, entities } = cached;
        let image = Bytes::from(self.pool.render(series, request.render.clone()).await?);
        PipelineCounters::incr(&self.counters.renders);

        self.cache.set_bytes(&image_key.with_tags(entities), &image).await;
        Ok(image)
    }

    /// Drop cached entries in `scope`. Returns the number of entries removed.
    pub async fn invalidate(&self, scope: InvalidationScope) -> u64 {
        let removed = match &scope {
            InvalidationScope::Entities(ids) => self.cache.invalidate_by_entities(ids).await,
            InvalidationScope::TimeRange { start, end } => self.cache.invalidate_by_time_range(*start, *end).await,
            InvalidationScope::All => self.cache.invalidate_all().await,
        };
        counter!("chart_cache_invalidated_total").increment(removed);
        info!(scope = ?scope, removed = removed, "Cache invalidated");
        removed
    }

    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            cache: self.cache.stats(),
            pool: self.pool.stats(),
            memory: MemoryStats::read(&self.counters),
        }
    }

    pub fn is_accepting(&self) -> bool {
        !self.admission.closed.load(Ordering::Acquire)
    }

    /// Stop admitting requests, drain in-flight ones, then stop the pool.
    ///
    /// Requests still running when the drain timeout expires have their
    /// render cancelled. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if !self.admission.close() {
            return;
        }
        let started = Instant::now();
        info!(
            in_flight = self.admission.in_flight(),
            drain_timeout_ms = self.drain_timeout.as_millis() as u64,
            "Shutting down chart pipeline"
        );

        let drained = self.admission.wait_idle(self.drain_timeout).await;
        if !drained {
            warn!(in_flight = self.admission.in_flight(), "Requests still running after drain timeout");
        }

        let remaining = self.drain_timeout.saturating_sub(started.elapsed());
        self.pool.shutdown(remaining).await;

        if !self.admission.wait_idle(UNWIND_GRACE).await {
            warn!(in_flight = self.admission.in_flight(), "Requests did not unwind after cancellation");
        }
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Chart pipeline stopped");
    }
}
