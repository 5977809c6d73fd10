//! Render pool behaviour with thread workers running scripted render functions.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chart_common::{ChartKind, ChartSeries, RenderError, RenderOptions};
use pipeline::{PoolConfig, PoolStats, RenderPool, RenderWorker, ThreadWorkerFactory, WorkerFactory};
use test_utils::sawtooth_series;

/// Render function whose behaviour is picked by the chart title.
///
/// - `slow`: sleeps 400 ms first
/// - `hang`: sleeps 3 s first
/// - `crash`: panics
/// - `bad`: fails with an encode error
fn scripted_factory(in_flight: Arc<AtomicUsize>, max_in_flight: Arc<AtomicUsize>) -> ThreadWorkerFactory {
    ThreadWorkerFactory::new(Arc::new(move |series: &ChartSeries, options: &RenderOptions| {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        max_in_flight.fetch_max(now, Ordering::SeqCst);
        let title = options.title.clone().unwrap_or_default();
        let result = match title.as_str() {
            "slow" => {
                std::thread::sleep(Duration::from_millis(400));
                renderer::render_chart(series, options)
            }
            "hang" => {
                std::thread::sleep(Duration::from_secs(3));
                renderer::render_chart(series, options)
            }
            "bad" => Err(RenderError::Encode("scripted encode failure".into())),
            "crash" => {
                in_flight.fetch_sub(1, Ordering::SeqCst);
                panic!("scripted render panic");
            }
            _ => renderer::render_chart(series, options),
        };
        in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }))
}

fn factory() -> Arc<ThreadWorkerFactory> {
    Arc::new(scripted_factory(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))))
}

fn config(size: usize) -> PoolConfig {
    PoolConfig {
        size,
        task_timeout: Duration::from_secs(5),
        queue_wait: Duration::from_secs(5),
        respawn_initial_backoff: Duration::from_millis(10),
        respawn_max_backoff: Duration::from_millis(50),
    }
}

fn options(title: &str) -> RenderOptions {
    let options = RenderOptions::new(ChartKind::Line, 200, 120);
    if title.is_empty() {
        options
    } else {
        options.with_title(title)
    }
}

async fn wait_for_stats(pool: &RenderPool, check: impl Fn(&PoolStats) -> bool) -> PoolStats {
    for _ in 0..600 {
        let stats = pool.stats();
        if check(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached expected state: {:?}", pool.stats());
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_renders_png() {
    let pool = RenderPool::start(factory(), config(2)).await.unwrap();
    let png = pool.render(sawtooth_series(5, 2), options("")).await.unwrap();
    assert_eq!(&png[1..4], b"PNG");

    let stats = pool.stats();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_busy_slots_never_exceed_size() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let factory = Arc::new(scripted_factory(in_flight, Arc::clone(&max_in_flight)));
    let pool = RenderPool::start(factory, config(2)).await.unwrap();

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.render(sawtooth_series(3, 1), options("slow")).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
    let stats = pool.stats();
    assert_eq!(stats.completed, 6);
    assert_eq!(stats.idle, 2);
}

#[tokio::test]
async fn test_queue_wait_expiry_is_saturation() {
    let pool = RenderPool::start(
        factory(),
        PoolConfig {
            queue_wait: Duration::from_millis(50),
            ..config(1)
        },
    )
    .await
    .unwrap();

    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.render(sawtooth_series(3, 1), options("slow")).await })
    };
    wait_for_stats(&pool, |s| s.busy == 1).await;

    let err = pool.render(sawtooth_series(3, 1), options("")).await.unwrap_err();
    assert!(matches!(err, RenderError::PoolSaturated(_)));
    assert!(busy.await.unwrap().is_ok());

    let stats = pool.stats();
    assert_eq!(stats.saturated, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_invalid_payload_never_reaches_a_worker() {
    let pool = RenderPool::start(factory(), config(1)).await.unwrap();
    let err = pool
        .render(sawtooth_series(3, 1), RenderOptions::new(ChartKind::Bar, 0, 100))
        .await
        .unwrap_err();
    assert!(matches!(err, RenderError::InvalidPayload(_)));

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
}

#[tokio::test]
async fn test_rejected_task_keeps_worker() {
    let pool = RenderPool::start(factory(), config(1)).await.unwrap();
    let err = pool.render(sawtooth_series(3, 1), options("bad")).await.unwrap_err();
    assert!(matches!(err, RenderError::Encode(_)));

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.respawns, 0);
    assert!(pool.render(sawtooth_series(3, 1), options("")).await.is_ok());
}

// ============================================================================
// Timeouts and crashes
// ============================================================================

#[tokio::test]
async fn test_timeout_rejects_within_margin_and_recycles() {
    let pool = RenderPool::start(
        factory(),
        PoolConfig {
            task_timeout: Duration::from_millis(100),
            ..config(1)
        },
    )
    .await
    .unwrap();

    let started = Instant::now();
    let err = pool.render(sawtooth_series(3, 1), options("hang")).await.unwrap_err();
    assert!(matches!(err, RenderError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = wait_for_stats(&pool, |s| s.idle == 1).await;
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.respawns, 1);
    assert!(pool.render(sawtooth_series(3, 1), options("")).await.is_ok());
}

#[tokio::test]
async fn test_timed_out_thread_holds_its_slot_until_it_exits() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let factory = Arc::new(scripted_factory(Arc::clone(&in_flight), Arc::clone(&max_in_flight)));
    let pool = RenderPool::start(
        factory,
        PoolConfig {
            task_timeout: Duration::from_millis(100),
            ..config(1)
        },
    )
    .await
    .unwrap();

    let started = Instant::now();
    let err = pool.render(sawtooth_series(3, 1), options("slow")).await.unwrap_err();
    assert!(matches!(err, RenderError::Timeout { .. }));
    assert_eq!(pool.stats().recycling, 1);

    // The next task runs only after the abandoned render has returned.
    assert!(pool.render(sawtooth_series(3, 1), options("")).await.is_ok());
    assert!(started.elapsed() >= Duration::from_millis(350));
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);

    let stats = pool.stats();
    assert_eq!(stats.respawns, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_crash_fails_task_and_restores_capacity() {
    let pool = RenderPool::start(factory(), config(2)).await.unwrap();

    let err = pool.render(sawtooth_series(3, 1), options("crash")).await.unwrap_err();
    assert!(matches!(err, RenderError::WorkerCrashed(_)));
    assert!(err.class() == chart_common::ErrorClass::Transient);

    assert!(pool.render(sawtooth_series(3, 1), options("")).await.is_ok());

    let stats = wait_for_stats(&pool, |s| s.idle == 2).await;
    assert_eq!(stats.crashes, 1);
    assert_eq!(stats.respawns, 1);
    assert_eq!(stats.recycling, 0);
}

/// Thread factory whose spawns fail a scripted number of times after startup.
struct FlakyFactory {
    inner: ThreadWorkerFactory,
    spawned: AtomicU32,
    startup: u32,
    failures_left: AtomicU32,
}

#[async_trait]
impl WorkerFactory for FlakyFactory {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn spawn(&self, slot: usize) -> Result<Box<dyn RenderWorker>, RenderError> {
        let n = self.spawned.fetch_add(1, Ordering::SeqCst);
        if n >= self.startup
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        {
            return Err(RenderError::Spawn("scripted spawn failure".into()));
        }
        self.inner.spawn(slot).await
    }
}

#[tokio::test]
async fn test_replacement_spawn_retries_with_backoff() {
    let factory = Arc::new(FlakyFactory {
        inner: scripted_factory(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        spawned: AtomicU32::new(0),
        startup: 1,
        failures_left: AtomicU32::new(2),
    });
    let pool = RenderPool::start(factory.clone(), config(1)).await.unwrap();

    assert!(pool.render(sawtooth_series(3, 1), options("crash")).await.is_err());

    // The next caller waits until the replacement finally spawns.
    assert!(pool.render(sawtooth_series(3, 1), options("")).await.is_ok());
    let stats = pool.stats();
    assert_eq!(stats.respawns, 1);
    assert_eq!(factory.spawned.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_start_fails_when_workers_cannot_spawn() {
    let factory = Arc::new(FlakyFactory {
        inner: ThreadWorkerFactory::default(),
        spawned: AtomicU32::new(0),
        startup: 0,
        failures_left: AtomicU32::new(1),
    });
    let result = RenderPool::start(factory, config(2)).await;
    assert!(matches!(result, Err(RenderError::Spawn(_))));
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_rejects_new_work_and_is_idempotent() {
    let pool = RenderPool::start(factory(), config(2)).await.unwrap();
    pool.shutdown(Duration::from_secs(1)).await;
    pool.shutdown(Duration::from_secs(1)).await;

    assert!(!pool.is_running());
    let err = pool.render(sawtooth_series(3, 1), options("")).await.unwrap_err();
    assert!(matches!(err, RenderError::ShuttingDown));
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test]
async fn test_shutdown_drains_running_tasks() {
    let pool = RenderPool::start(factory(), config(1)).await.unwrap();
    let running = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.render(sawtooth_series(3, 1), options("slow")).await })
    };
    wait_for_stats(&pool, |s| s.busy == 1).await;

    pool.shutdown(Duration::from_secs(5)).await;
    assert!(running.await.unwrap().is_ok());
    assert_eq!(pool.stats().completed, 1);
}

#[tokio::test]
async fn test_shutdown_cancels_after_drain_timeout() {
    let pool = RenderPool::start(factory(), config(1)).await.unwrap();
    let running = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.render(sawtooth_series(3, 1), options("hang")).await })
    };
    wait_for_stats(&pool, |s| s.busy == 1).await;

    let started = Instant::now();
    let stopping = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.shutdown(Duration::from_millis(100)).await })
    };
    assert!(matches!(running.await.unwrap(), Err(RenderError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));

    // Shutdown itself returns once the cancelled thread has exited.
    stopping.await.unwrap();
    assert!(!pool.is_running());
    assert_eq!(pool.stats().busy, 0);
}

#[tokio::test]
async fn test_shutdown_releases_waiting_callers() {
    let pool = RenderPool::start(factory(), config(1)).await.unwrap();
    let running = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.render(sawtooth_series(3, 1), options("slow")).await })
    };
    wait_for_stats(&pool, |s| s.busy == 1).await;

    let waiting = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.render(sawtooth_series(3, 1), options("")).await })
    };
    wait_for_stats(&pool, |s| s.waiting == 1).await;

    pool.shutdown(Duration::from_secs(5)).await;
    assert!(matches!(waiting.await.unwrap(), Err(RenderError::ShuttingDown)));
    assert!(running.await.unwrap().is_ok());
}
