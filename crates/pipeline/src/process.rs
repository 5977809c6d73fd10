//! Worker backend running each slot as a separate OS process.
//!
//! The child speaks the framed protocol from [`chart_common::protocol`] on its
//! stdin/stdout. Children are spawned with `kill_on_drop`, so a worker that is
//! dropped without [`RenderWorker::terminate`] still cannot outlive the pool.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use chart_common::protocol::{read_frame, write_frame, ProtocolError, RenderRequest, ResponseHeader, WorkerErrorKind};
use chart_common::RenderError;

use crate::worker::{RenderWorker, WorkerFactory, WorkerFault};

/// How long a worker gets to exit after its stdin closes.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// How long a broken worker gets to be reaped before its fault is reported.
const REAP_WAIT: Duration = Duration::from_millis(100);

/// Spawns `program` once per slot.
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessWorkerFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    fn backend(&self) -> &'static str {
        "process"
    }

    async fn spawn(&self, slot: usize) -> Result<Box<dyn RenderWorker>, RenderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RenderError::Spawn(format!("{}: {}", self.program.display(), e)))?;

        let stdin = child.stdin.take().ok_or_else(|| RenderError::Spawn("child stdin not captured".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| RenderError::Spawn("child stdout not captured".into()))?;

        let name = format!("process-{}-{}", slot, child.id().unwrap_or_default());
        info!(worker = %name, program = %self.program.display(), "Spawned render worker process");

        Ok(Box::new(ProcessWorker {
            name,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        }))
    }
}

/// A live worker process.
pub struct ProcessWorker {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ProcessWorker {
    /// Describe a broken stream, including the exit status when the child is gone.
    ///
    /// The pipe usually closes a moment before the child can be reaped, so
    /// this waits briefly for the status.
    async fn crash(&mut self, error: ProtocolError) -> WorkerFault {
        match tokio::time::timeout(REAP_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => WorkerFault::Crashed(format!("exited with {} ({})", status, error)),
            _ => WorkerFault::Crashed(error.to_string()),
        }
    }
}

#[async_trait]
impl RenderWorker for ProcessWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn render(&mut self, request: &RenderRequest) -> Result<Vec<u8>, WorkerFault> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| WorkerFault::Crashed("worker already terminated".into()))?;

        if let Err(e) = write_frame(stdin, request, &[]).await {
            return Err(self.crash(e).await);
        }

        let (header, payload): (ResponseHeader, Vec<u8>) = match read_frame(&mut self.stdout).await {
            Ok(frame) => frame,
            Err(e) => return Err(self.crash(e).await),
        };

        if header.task_id() != request.task_id {
            return Err(WorkerFault::Crashed(format!(
                "response for task {} while waiting for {}",
                header.task_id(),
                request.task_id
            )));
        }

        match header {
            ResponseHeader::Ok { .. } => Ok(payload),
            ResponseHeader::Error { kind, message, .. } => Err(WorkerFault::Rejected(match kind {
                WorkerErrorKind::InvalidPayload => RenderError::InvalidPayload(message),
                WorkerErrorKind::Encode => RenderError::Encode(message),
            })),
        }
    }

    async fn terminate(&mut self) {
        // Closing stdin ends the worker's frame loop.
        drop(self.stdin.take());

        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(worker = %self.name, status = %status, "Render worker exited"),
            Ok(Err(e)) => warn!(worker = %self.name, error = %e, "Failed to reap render worker"),
            Err(_) => {
                warn!(worker = %self.name, "Render worker ignored shutdown, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(worker = %self.name, error = %e, "Failed to kill render worker");
                }
            }
        }
    }
}
