//! Worker backend running each slot on a dedicated OS thread.
//!
//! A panic inside the render function ends the thread; the pending caller sees
//! its reply channel close and the slot is reported as crashed. Threads cannot
//! be killed, so terminating a worker waits (up to the exit wait) for its
//! current render to return. The pool only refills the slot after that, which
//! keeps the number of live render threads at the pool size.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use chart_common::protocol::RenderRequest;
use chart_common::{ChartSeries, RenderError, RenderOptions};

use crate::worker::{RenderWorker, WorkerFactory, WorkerFault};

/// Function a thread worker runs for each task.
pub type RenderFn = Arc<dyn Fn(&ChartSeries, &RenderOptions) -> Result<Vec<u8>, RenderError> + Send + Sync>;

type Reply = oneshot::Sender<Result<Vec<u8>, RenderError>>;

/// Longest a terminated worker waits for its thread to exit.
pub const DEFAULT_EXIT_WAIT: Duration = Duration::from_secs(60);

/// Spawns one named thread per slot.
#[derive(Clone)]
pub struct ThreadWorkerFactory {
    render: RenderFn,
    exit_wait: Duration,
}

impl Default for ThreadWorkerFactory {
    fn default() -> Self {
        Self::new(Arc::new(|series: &ChartSeries, options: &RenderOptions| {
            renderer::render_chart(series, options)
        }))
    }
}

impl ThreadWorkerFactory {
    /// Factory running `render` instead of the chart renderer.
    pub fn new(render: RenderFn) -> Self {
        Self {
            render,
            exit_wait: DEFAULT_EXIT_WAIT,
        }
    }

    /// Bound on how long `terminate` waits for a busy thread.
    pub fn with_exit_wait(mut self, exit_wait: Duration) -> Self {
        self.exit_wait = exit_wait;
        self
    }
}

#[async_trait]
impl WorkerFactory for ThreadWorkerFactory {
    fn backend(&self) -> &'static str {
        "thread"
    }

    async fn spawn(&self, slot: usize) -> Result<Box<dyn RenderWorker>, RenderError> {
        let (tx, mut rx) = mpsc::channel::<(RenderRequest, Reply)>(1);
        // Dropped when the thread exits, including by panic.
        let (exited_tx, exited_rx) = oneshot::channel::<()>();
        let render = Arc::clone(&self.render);
        let name = format!("chart-render-{}", slot);

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _exited = exited_tx;
                while let Some((request, reply)) = rx.blocking_recv() {
                    let result = render(&request.series, &request.options);
                    // The caller may have timed out and gone away.
                    let _ = reply.send(result);
                }
            })
            .map_err(|e| RenderError::Spawn(format!("{}: {}", name, e)))?;

        info!(worker = %name, "Spawned render worker thread");
        Ok(Box::new(ThreadWorker {
            name,
            tx: Some(tx),
            exited: Some(exited_rx),
            exit_wait: self.exit_wait,
        }))
    }
}

/// Handle to a render thread.
pub struct ThreadWorker {
    name: String,
    tx: Option<mpsc::Sender<(RenderRequest, Reply)>>,
    exited: Option<oneshot::Receiver<()>>,
    exit_wait: Duration,
}

#[async_trait]
impl RenderWorker for ThreadWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn render(&mut self, request: &RenderRequest) -> Result<Vec<u8>, WorkerFault> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| WorkerFault::Crashed("worker already terminated".into()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((request.clone(), reply_tx))
            .await
            .map_err(|_| WorkerFault::Crashed(format!("{} is no longer running", self.name)))?;

        match reply_rx.await {
            Ok(Ok(image)) => Ok(image),
            Ok(Err(e)) => Err(WorkerFault::Rejected(e)),
            Err(_) => Err(WorkerFault::Crashed(format!("{} panicked during render", self.name))),
        }
    }

    async fn terminate(&mut self) {
        // Dropping the sender ends the thread's receive loop once the current
        // render returns.
        self.tx.take();
        let Some(exited) = self.exited.take() else {
            return;
        };

        let started = Instant::now();
        match tokio::time::timeout(self.exit_wait, exited).await {
            Ok(_) => debug!(
                worker = %self.name,
                waited_ms = started.elapsed().as_millis() as u64,
                "Render worker thread exited"
            ),
            Err(_) => warn!(
                worker = %self.name,
                exit_wait_ms = self.exit_wait.as_millis() as u64,
                "Render worker thread still busy, detaching it"
            ),
        }
    }
}
