//! Fixed-size render worker pool.
//!
//! Slot accounting is a semaphore with one permit per slot plus a queue of
//! idle workers. A permit is held for the whole life of a busy slot, including
//! the old worker's termination and the replacement spawn after a crash or
//! timeout, so at most `size` slots are ever busy and every acquired permit
//! finds an idle worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use chart_common::protocol::RenderRequest;
use chart_common::{ChartSeries, RenderError, RenderOptions, RenderTask};

use crate::config::PoolConfig;
use crate::worker::{RenderWorker, WorkerFactory, WorkerFault};

/// How long shutdown waits for cancelled tasks to give their slots back.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Running,
    /// No new work; busy slots finish normally.
    Draining,
    /// Busy slots abort their task.
    Cancelling,
    Stopped,
}

/// Snapshot of pool state and lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    /// Slots whose worker is being replaced.
    pub recycling: usize,
    /// Callers waiting for a slot.
    pub waiting: usize,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub crashes: u64,
    pub respawns: u64,
    /// Callers that gave up waiting for a slot.
    pub saturated: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    busy: AtomicUsize,
    recycling: AtomicUsize,
    waiting: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    crashes: AtomicU64,
    respawns: AtomicU64,
    saturated: AtomicU64,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn WorkerFactory>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Box<dyn RenderWorker>>>,
    phase: watch::Sender<Phase>,
    next_slot: AtomicUsize,
    counters: PoolCounters,
}

/// Resolves once the pool phase reaches `phase`.
async fn phase_reached(rx: &mut watch::Receiver<Phase>, phase: Phase) {
    let _ = rx.wait_for(|current| *current >= phase).await;
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<Box<dyn RenderWorker>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn fail(&self, outcome: &'static str) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        counter!("chart_render_tasks_total", "outcome" => outcome).increment(1);
    }

    /// Terminate `worker` and spawn its replacement in the background.
    ///
    /// `permit` is released only once the slot has a worker again (or the pool
    /// is shutting down).
    fn recycle(self: &Arc<Self>, mut worker: Box<dyn RenderWorker>, permit: Option<OwnedSemaphorePermit>) {
        self.counters.recycling.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            worker.terminate().await;
            drop(worker);
            inner.respawn().await;
            inner.counters.recycling.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    /// Terminate `worker` without replacing it.
    fn retire(self: &Arc<Self>, mut worker: Box<dyn RenderWorker>, permit: Option<OwnedSemaphorePermit>) {
        tokio::spawn(async move {
            worker.terminate().await;
            drop(permit);
        });
    }

    /// Spawn one replacement worker, retrying with backoff while the pool runs.
    async fn respawn(&self) {
        let mut phase_rx = self.phase.subscribe();
        let mut attempt = 0;

        while self.phase() < Phase::Cancelling {
            attempt += 1;
            let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
            match self.factory.spawn(slot).await {
                Ok(mut worker) => {
                    self.counters.respawns.fetch_add(1, Ordering::Relaxed);
                    counter!("chart_render_worker_respawns_total").increment(1);
                    if self.phase() == Phase::Stopped {
                        worker.terminate().await;
                    } else {
                        info!(worker = %worker.name(), attempt = attempt, "Replacement render worker ready");
                        self.idle().push_back(worker);
                    }
                    return;
                }
                Err(e) => {
                    let delay = self.config.respawn_backoff(attempt);
                    warn!(
                        error = %e,
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to spawn replacement render worker"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = phase_reached(&mut phase_rx, Phase::Draining) => return,
                    }
                }
            }
        }
    }
}

/// A slot taken out of the idle queue for one task.
///
/// Dropping the slot while the worker is still inside (the caller's future was
/// dropped mid-render) recycles the worker, since its stream may be half used.
struct BusySlot {
    inner: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
    worker: Option<Box<dyn RenderWorker>>,
}

impl BusySlot {
    fn new(inner: Arc<PoolInner>, permit: OwnedSemaphorePermit, worker: Box<dyn RenderWorker>) -> Self {
        let busy = inner.counters.busy.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("chart_render_pool_busy").set(busy as f64);
        Self {
            inner,
            permit: Some(permit),
            worker: Some(worker),
        }
    }

    fn worker_name(&self) -> &str {
        self.worker.as_ref().map_or("none", |w| w.name())
    }

    async fn render(&mut self, request: &RenderRequest) -> Result<Vec<u8>, WorkerFault> {
        match self.worker.as_mut() {
            Some(worker) => worker.render(request).await,
            None => Err(WorkerFault::Crashed("slot has no worker".into())),
        }
    }

    /// Return the worker to the idle queue.
    fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            if self.inner.phase() == Phase::Stopped {
                self.inner.retire(worker, self.permit.take());
            } else {
                self.inner.idle().push_back(worker);
            }
        }
    }

    fn recycle(mut self) {
        if let Some(worker) = self.worker.take() {
            self.inner.recycle(worker, self.permit.take());
        }
    }

    fn retire(mut self) {
        if let Some(worker) = self.worker.take() {
            self.inner.retire(worker, self.permit.take());
        }
    }
}

impl Drop for BusySlot {
    fn drop(&mut self) {
        let busy = self.inner.counters.busy.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!("chart_render_pool_busy").set(busy as f64);

        if let Some(worker) = self.worker.take() {
            if tokio::runtime::Handle::try_current().is_ok() {
                debug!(worker = %worker.name(), "Render caller went away mid-task, recycling worker");
                self.inner.recycle(worker, self.permit.take());
            }
        }
    }
}

/// Counts a caller as waiting for as long as it lives.
struct WaitingGuard<'a> {
    counters: &'a PoolCounters,
}

impl<'a> WaitingGuard<'a> {
    fn new(counters: &'a PoolCounters) -> Self {
        counters.waiting.fetch_add(1, Ordering::Relaxed);
        Self { counters }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.counters.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

enum Outcome {
    Finished(Result<Vec<u8>, WorkerFault>),
    TimedOut,
    Cancelled,
}

/// Pool of isolated render workers.
#[derive(Clone)]
pub struct RenderPool {
    inner: Arc<PoolInner>,
}

impl RenderPool {
    /// Spawn `config.size` workers and start accepting tasks.
    pub async fn start(factory: Arc<dyn WorkerFactory>, mut config: PoolConfig) -> Result<Self, RenderError> {
        config.size = config.size.max(1);

        let mut workers: VecDeque<Box<dyn RenderWorker>> = VecDeque::with_capacity(config.size);
        for slot in 0..config.size {
            match factory.spawn(slot).await {
                Ok(worker) => workers.push_back(worker),
                Err(e) => {
                    for mut worker in workers {
                        worker.terminate().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            backend = factory.backend(),
            size = config.size,
            task_timeout_ms = config.task_timeout.as_millis() as u64,
            queue_wait_ms = config.queue_wait.as_millis() as u64,
            "Render pool started"
        );

        let (phase, _) = watch::channel(Phase::Running);
        Ok(Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.size)),
                next_slot: AtomicUsize::new(config.size),
                idle: Mutex::new(workers),
                counters: PoolCounters::default(),
                factory,
                phase,
                config,
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.config.size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.phase() == Phase::Running
    }

    /// Render `series` with `options` on the next free worker.
    pub async fn render(&self, series: ChartSeries, options: RenderOptions) -> Result<Vec<u8>, RenderError> {
        self.run(RenderTask::new(series, options)).await
    }

    /// Run one task to completion, timeout, crash or cancellation.
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.options.kind))]
    pub async fn run(&self, task: RenderTask) -> Result<Vec<u8>, RenderError> {
        let inner = &self.inner;
        if inner.phase() != Phase::Running {
            return Err(RenderError::ShuttingDown);
        }
        if let Err(e) = task.validate() {
            inner.fail("invalid");
            return Err(e);
        }

        let mut slot = self.checkout().await?;
        let request = RenderRequest::from(&task);
        let timeout = inner.config.task_timeout;
        let started = Instant::now();
        let mut phase_rx = inner.phase.subscribe();

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, slot.render(&request)) => match result {
                Ok(result) => Outcome::Finished(result),
                Err(_) => Outcome::TimedOut,
            },
            _ = phase_reached(&mut phase_rx, Phase::Cancelling) => Outcome::Cancelled,
        };
        let elapsed = started.elapsed();

        match outcome {
            Outcome::Finished(Ok(image)) => {
                inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                counter!("chart_render_tasks_total", "outcome" => "ok").increment(1);
                histogram!("chart_render_duration_seconds").record(elapsed.as_secs_f64());
                debug!(
                    worker = %slot.worker_name(),
                    bytes = image.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Render task complete"
                );
                slot.release();
                Ok(image)
            }
            Outcome::Finished(Err(WorkerFault::Rejected(e))) => {
                inner.fail("rejected");
                warn!(worker = %slot.worker_name(), error = %e, "Render worker rejected task");
                slot.release();
                Err(e)
            }
            Outcome::Finished(Err(WorkerFault::Crashed(message))) => {
                inner.counters.crashes.fetch_add(1, Ordering::Relaxed);
                inner.fail("crashed");
                warn!(worker = %slot.worker_name(), error = %message, "Render worker crashed, replacing it");
                slot.recycle();
                Err(RenderError::WorkerCrashed(message))
            }
            Outcome::TimedOut => {
                inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                inner.fail("timeout");
                warn!(
                    worker = %slot.worker_name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Render task timed out, recycling worker"
                );
                slot.recycle();
                Err(RenderError::Timeout {
                    task_id: task.id,
                    timeout,
                })
            }
            Outcome::Cancelled => {
                inner.fail("cancelled");
                slot.retire();
                Err(RenderError::Cancelled)
            }
        }
    }

    /// Wait for a free slot and take its worker.
    async fn checkout(&self) -> Result<BusySlot, RenderError> {
        let inner = &self.inner;
        let queue_wait = inner.config.queue_wait;
        let mut phase_rx = inner.phase.subscribe();

        let waiting = WaitingGuard::new(&inner.counters);
        let acquired = tokio::select! {
            biased;
            _ = phase_reached(&mut phase_rx, Phase::Draining) => Err(RenderError::ShuttingDown),
            result = tokio::time::timeout(queue_wait, Arc::clone(&inner.permits).acquire_owned()) => match result {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(RenderError::ShuttingDown),
                Err(_) => Err(RenderError::PoolSaturated(queue_wait)),
            },
        };
        drop(waiting);

        let permit = match acquired {
            Ok(permit) => permit,
            Err(RenderError::PoolSaturated(wait)) => {
                inner.counters.saturated.fetch_add(1, Ordering::Relaxed);
                inner.fail("saturated");
                warn!(queue_wait_ms = wait.as_millis() as u64, "No render worker became available");
                return Err(RenderError::PoolSaturated(wait));
            }
            Err(e) => return Err(e),
        };
        if inner.phase() != Phase::Running {
            return Err(RenderError::ShuttingDown);
        }

        let idle = inner.idle().pop_front();
        let worker = match idle {
            Some(worker) => worker,
            None => {
                // Every permit should come with an idle worker; spawn one if not.
                let slot = inner.next_slot.fetch_add(1, Ordering::Relaxed);
                let worker = inner.factory.spawn(slot).await?;
                inner.counters.respawns.fetch_add(1, Ordering::Relaxed);
                worker
            }
        };
        Ok(BusySlot::new(Arc::clone(inner), permit, worker))
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let c = &inner.counters;
        PoolStats {
            size: inner.config.size,
            idle: inner.idle().len(),
            busy: c.busy.load(Ordering::Relaxed),
            recycling: c.recycling.load(Ordering::Relaxed),
            waiting: c.waiting.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            crashes: c.crashes.load(Ordering::Relaxed),
            respawns: c.respawns.load(Ordering::Relaxed),
            saturated: c.saturated.load(Ordering::Relaxed),
        }
    }

    /// Stop the pool.
    ///
    /// New work is rejected at once and waiting callers fail with
    /// [`RenderError::ShuttingDown`]. Busy slots get `drain_timeout` to finish;
    /// tasks still running after that are cancelled. Finally every worker is
    /// terminated. Calling it again is a no-op.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let inner = &self.inner;
        let started = inner.phase.send_if_modified(|phase| {
            if *phase == Phase::Running {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        let size = inner.config.size as u32;
        info!(
            busy = inner.counters.busy.load(Ordering::Relaxed),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "Draining render pool"
        );

        let drained = match tokio::time::timeout(drain_timeout, inner.permits.acquire_many(size)).await {
            Ok(Ok(permits)) => Some(permits),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(
                    busy = inner.counters.busy.load(Ordering::Relaxed),
                    "Drain timeout expired, cancelling running render tasks"
                );
                inner.phase.send_replace(Phase::Cancelling);
                tokio::time::timeout(CANCEL_GRACE, inner.permits.acquire_many(size))
                    .await
                    .ok()
                    .and_then(Result::ok)
            }
        };
        if drained.is_none() {
            warn!("Render slots still busy after cancellation");
        }

        inner.phase.send_replace(Phase::Stopped);
        let workers: Vec<Box<dyn RenderWorker>> = inner.idle().drain(..).collect();
        let terminated = workers.len();
        for mut worker in workers {
            worker.terminate().await;
        }
        drop(drained);
        inner.permits.close();

        let stats = self.stats();
        info!(
            terminated = terminated,
            completed = stats.completed,
            failed = stats.failed,
            "Render pool stopped"
        );
    }
}
