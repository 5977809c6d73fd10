//! Render worker abstraction shared by the process and thread backends.

use async_trait::async_trait;
use thiserror::Error;

use chart_common::protocol::RenderRequest;
use chart_common::RenderError;

/// Why a render attempt on one worker failed.
#[derive(Debug, Error)]
pub enum WorkerFault {
    /// The worker is alive but refused the task.
    #[error(transparent)]
    Rejected(RenderError),

    /// The worker died or its stream is no longer trustworthy.
    #[error("worker crashed: {0}")]
    Crashed(String),
}

/// One isolated renderer occupying a pool slot.
#[async_trait]
pub trait RenderWorker: Send {
    /// Slot-unique label used in logs.
    fn name(&self) -> &str;

    /// Render one request and return the encoded image.
    async fn render(&mut self, request: &RenderRequest) -> Result<Vec<u8>, WorkerFault>;

    /// Stop the worker. Called once, after which the worker is dropped.
    async fn terminate(&mut self);
}

/// Creates workers for the pool, both at startup and after crashes.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    async fn spawn(&self, slot: usize) -> Result<Box<dyn RenderWorker>, RenderError>;
}
