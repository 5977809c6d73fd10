//! End-to-end coordinator behaviour over memory stores and thread workers.

use std::sync::Arc;
use std::time::Duration;

use aggregation::RetryPolicy;
use chart_common::{
    AggregationError, ChartKind, ChartSeries, ErrorClass, GroupingUnit, Metric, PipelineError, RenderOptions,
    RepositoryError,
};
use pipeline::{
    ChartPipeline, ChartRequest, InvalidationScope, PipelineConfig, PoolConfig, RawChartParams, ThreadWorkerFactory,
};
use storage::{ActivityRepository, CacheStore, MemoryRepository, MemoryStore};
use test_utils::{at, day, example_week_records, kill, FailingStore, FlakyRepository};

fn config() -> PipelineConfig {
    let mut config = PipelineConfig {
        pool: PoolConfig {
            size: 2,
            task_timeout: Duration::from_secs(5),
            queue_wait: Duration::from_secs(5),
            ..PoolConfig::default()
        },
        drain_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    };
    config.aggregation.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    };
    config
}

async fn pipeline_with(
    store: Arc<dyn CacheStore>,
    repository: Arc<dyn ActivityRepository>,
    factory: ThreadWorkerFactory,
) -> ChartPipeline {
    ChartPipeline::start(config(), store, repository, Arc::new(factory)).await.unwrap()
}

async fn pipeline(repository: Arc<dyn ActivityRepository>) -> ChartPipeline {
    pipeline_with(Arc::new(MemoryStore::new(64, 10_000)), repository, ThreadWorkerFactory::default()).await
}

fn week_request(entities: &[&str]) -> ChartRequest {
    ChartRequest::new(
        entities.iter().copied(),
        day(1),
        day(8),
        GroupingUnit::Day,
        Metric::Count,
        RenderOptions::new(ChartKind::Bar, 320, 200),
    )
    .unwrap()
}

// ============================================================================
// Request path
// ============================================================================

#[tokio::test]
async fn test_example_week_renders_chart() {
    let repo = Arc::new(FlakyRepository::with_records(example_week_records()));
    let pipeline = pipeline(repo.clone()).await;

    let image = pipeline.get_chart(&week_request(&["A", "B"]).with_limit(1).unwrap()).await.unwrap();
    assert_eq!(&image[1..4], b"PNG");

    let metrics = pipeline.metrics();
    assert_eq!(metrics.memory.requests, 1);
    assert_eq!(metrics.memory.aggregations, 1);
    assert_eq!(metrics.memory.renders, 1);
    assert_eq!(metrics.pool.completed, 1);
    assert_eq!(repo.record_calls(), 1);
}

#[tokio::test]
async fn test_repeated_request_served_from_image_cache() {
    let repo = Arc::new(FlakyRepository::with_records(example_week_records()));
    let pipeline = pipeline(repo.clone()).await;
    let request = week_request(&["A", "B"]);

    let first = pipeline.get_chart(&request).await.unwrap();
    let second = pipeline.get_chart(&request).await.unwrap();
    assert_eq!(first, second);

    let metrics = pipeline.metrics();
    assert_eq!(metrics.memory.image_hits, 1);
    assert_eq!(metrics.memory.aggregations, 1);
    assert_eq!(metrics.pool.completed, 1);
    assert_eq!(metrics.cache.rendered_image.hits, 1);
    assert_eq!(repo.record_calls(), 1);
}

#[tokio::test]
async fn test_new_render_options_reuse_cached_series() {
    let repo = Arc::new(FlakyRepository::with_records(example_week_records()));
    let pipeline = pipeline(repo.clone()).await;
    let request = week_request(&["A", "B"]);

    pipeline.get_chart(&request).await.unwrap();
    let mut line = request.clone();
    line.render.kind = ChartKind::Line;
    pipeline.get_chart(&line).await.unwrap();

    let metrics = pipeline.metrics();
    assert_eq!(metrics.memory.series_hits, 1);
    assert_eq!(metrics.memory.aggregations, 1);
    assert_eq!(metrics.memory.renders, 2);
    assert_eq!(repo.record_calls(), 1);
}

#[tokio::test]
async fn test_tied_ranking_follows_each_request_order() {
    // Renders the first letter of each dataset so the chosen entity is visible.
    let factory = ThreadWorkerFactory::new(Arc::new(
        |series: &ChartSeries, _: &RenderOptions| -> Result<Vec<u8>, chart_common::RenderError> {
            Ok(series.datasets.iter().map(|d| d.name.as_bytes()[0]).collect())
        },
    ));
    let repo = Arc::new(MemoryRepository::with_records(vec![kill("A", at(2, 3)), kill("B", at(3, 3))]));
    let pipeline = pipeline_with(Arc::new(MemoryStore::new(64, 10_000)), repo, factory).await;
    let ab = week_request(&["A", "B"]).with_limit(1).unwrap();
    let ba = week_request(&["B", "A"]).with_limit(1).unwrap();

    assert_eq!(&pipeline.get_chart(&ba).await.unwrap()[..], b"B");
    assert_eq!(&pipeline.get_chart(&ab).await.unwrap()[..], b"A");
    assert_eq!(&pipeline.get_chart(&ba).await.unwrap()[..], b"B");

    let metrics = pipeline.metrics();
    assert_eq!(metrics.memory.image_hits, 1);
    assert_eq!(metrics.memory.renders, 2);
}

#[tokio::test]
async fn test_failing_cache_store_does_not_fail_requests() {
    let store = Arc::new(FailingStore::new());
    let repo = Arc::new(MemoryRepository::with_records(example_week_records()));
    let pipeline = pipeline_with(store.clone(), repo, ThreadWorkerFactory::default()).await;
    let request = week_request(&["A", "B"]);

    assert!(pipeline.get_chart(&request).await.is_ok());
    assert!(pipeline.get_chart(&request).await.is_ok());

    let metrics = pipeline.metrics();
    assert_eq!(metrics.memory.aggregations, 2);
    assert_eq!(metrics.memory.failures, 0);
    assert!(metrics.cache.rendered_image.errors > 0);
    assert!(store.calls() > 0);
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn test_rejected_query_is_fatal() {
    let repo = Arc::new(FlakyRepository::with_records(example_week_records()));
    repo.fail_records(1, RepositoryError::Rejected("bad range".into()));
    let pipeline = pipeline(repo.clone()).await;

    let err = pipeline.get_chart(&week_request(&["A"])).await.unwrap_err();
    assert!(matches!(err, PipelineError::Aggregation(AggregationError::Store { attempts: 1, .. })));
    assert_eq!(err.class(), ErrorClass::Fatal);
    assert_eq!(pipeline.metrics().memory.failures, 1);
    assert_eq!(pipeline.metrics().pool.completed, 0);
}

#[tokio::test]
async fn test_unbounded_hourly_range_is_fatal() {
    let repo = Arc::new(FlakyRepository::with_records(example_week_records()));
    let pipeline = pipeline(repo.clone()).await;
    let request = ChartRequest::from_params(RawChartParams {
        entities: vec!["A".into()],
        start: Some("0001-01-01".into()),
        end: Some("9999-12-31".into()),
        grouping: Some("hour".into()),
        metric: Some("count".into()),
        ..RawChartParams::default()
    })
    .unwrap();

    let err = pipeline.get_chart(&request).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Aggregation(AggregationError::InvalidParameter { ref param, .. }) if param == "range"
    ));
    assert_eq!(err.class(), ErrorClass::Fatal);
    assert_eq!(repo.record_calls() + repo.related_calls(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_are_transient() {
    let repo = Arc::new(FlakyRepository::with_records(example_week_records()));
    repo.fail_records(3, RepositoryError::Timeout("slow store".into()));
    let pipeline = pipeline(repo.clone()).await;
    let request = week_request(&["A"]);

    let err = pipeline.get_chart(&request).await.unwrap_err();
    assert!(err.is_retryable());

    // Nothing partial was cached: the retry succeeds from scratch.
    assert!(pipeline.get_chart(&request).await.is_ok());
    assert_eq!(repo.record_calls(), 4);
}

#[tokio::test]
async fn test_worker_crash_surfaces_as_transient() {
    let factory = ThreadWorkerFactory::new(Arc::new(
        |_: &ChartSeries, _: &RenderOptions| -> Result<Vec<u8>, chart_common::RenderError> {
            panic!("renderer blew up")
        },
    ));
    let repo = Arc::new(MemoryRepository::with_records(example_week_records()));
    let pipeline = pipeline_with(Arc::new(MemoryStore::new(64, 10_000)), repo, factory).await;

    let err = pipeline.get_chart(&week_request(&["A"])).await.unwrap_err();
    assert!(matches!(err, PipelineError::Render(chart_common::RenderError::WorkerCrashed(_))));
    assert!(err.is_retryable());
    assert_eq!(pipeline.metrics().cache.rendered_image.writes, 0);
}

// ============================================================================
// Invalidation
// ============================================================================

#[tokio::test]
async fn test_invalidate_entities_is_selective() {
    let repo = Arc::new(FlakyRepository::with_records(example_week_records()));
    let pipeline = pipeline(repo.clone()).await;
    let a = week_request(&["A"]);
    let b = week_request(&["B"]);
    pipeline.get_chart(&a).await.unwrap();
    pipeline.get_chart(&b).await.unwrap();

    let removed = pipeline.invalidate(InvalidationScope::Entities(vec!["B".into()])).await;
    assert!(removed > 0);

    pipeline.get_chart(&a).await.unwrap();
    pipeline.get_chart(&b).await.unwrap();
    let metrics = pipeline.metrics();
    assert_eq!(metrics.memory.image_hits, 1);
    assert_eq!(metrics.memory.aggregations, 3);
}

#[tokio::test]
async fn test_invalidating_related_entity_drops_chart() {
    let repo = Arc::new(MemoryRepository::with_records(example_week_records()));
    repo.relate("A", "R").await;
    repo.insert(kill("R", day(3))).await;
    let pipeline = pipeline(repo.clone()).await;
    let request = week_request(&["A"]);

    pipeline.get_chart(&request).await.unwrap();
    pipeline.invalidate(InvalidationScope::Entities(vec!["R".into()])).await;
    pipeline.get_chart(&request).await.unwrap();

    let metrics = pipeline.metrics();
    assert_eq!(metrics.memory.image_hits, 0);
    assert_eq!(metrics.memory.aggregations, 2);
}

#[tokio::test]
async fn test_invalidate_time_range_and_all() {
    let repo = Arc::new(MemoryRepository::with_records(example_week_records()));
    let pipeline = pipeline(repo).await;
    let request = week_request(&["A", "B"]);
    pipeline.get_chart(&request).await.unwrap();

    // A range after the request's span leaves the chart cached.
    let removed = pipeline
        .invalidate(InvalidationScope::TimeRange { start: day(20), end: day(21) })
        .await;
    assert_eq!(removed, 0);
    pipeline.get_chart(&request).await.unwrap();
    assert_eq!(pipeline.metrics().memory.image_hits, 1);

    let removed = pipeline
        .invalidate(InvalidationScope::TimeRange { start: day(3), end: day(4) })
        .await;
    assert!(removed > 0);
    pipeline.get_chart(&request).await.unwrap();
    assert_eq!(pipeline.metrics().memory.aggregations, 2);

    assert!(pipeline.invalidate(InvalidationScope::All).await > 0);
    pipeline.get_chart(&request).await.unwrap();
    assert_eq!(pipeline.metrics().memory.aggregations, 3);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_shutdown_rejects_later_requests() {
    let repo = Arc::new(MemoryRepository::with_records(example_week_records()));
    let pipeline = pipeline(repo).await;
    pipeline.get_chart(&week_request(&["A"])).await.unwrap();

    pipeline.shutdown().await;
    pipeline.shutdown().await;

    assert!(!pipeline.is_accepting());
    let err = pipeline.get_chart(&week_request(&["A"])).await.unwrap_err();
    assert!(matches!(err, PipelineError::ShuttingDown));
    assert!(err.is_retryable());

    let pool = pipeline.metrics().pool;
    assert_eq!(pool.idle, 0);
    assert_eq!(pool.busy, 0);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_request() {
    let slow = ThreadWorkerFactory::new(Arc::new(|series: &ChartSeries, options: &RenderOptions| {
        std::thread::sleep(Duration::from_millis(300));
        renderer::render_chart(series, options)
    }));
    let repo = Arc::new(MemoryRepository::with_records(example_week_records()));
    let pipeline = Arc::new(pipeline_with(Arc::new(MemoryStore::new(64, 10_000)), repo, slow).await);

    let in_flight = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.get_chart(&week_request(&["A"])).await })
    };
    for _ in 0..100 {
        if pipeline.metrics().pool.busy == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    pipeline.shutdown().await;
    assert!(in_flight.await.unwrap().is_ok());
    assert_eq!(pipeline.metrics().memory.renders, 1);
}

#[tokio::test]
async fn test_metrics_serialize() {
    let repo = Arc::new(MemoryRepository::with_records(example_week_records()));
    let pipeline = pipeline(repo).await;
    let json = serde_json::to_value(pipeline.metrics()).unwrap();
    assert_eq!(json["pool"]["size"], 2);
    assert!(json["cache"]["rendered_image"]["hits"].is_u64());
    assert!(json["memory"]["rss_bytes"].is_u64());
}
