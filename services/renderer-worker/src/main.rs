//! Renderer worker process.
//!
//! Reads render requests as frames on stdin and answers each with one frame
//! on stdout. Logs go to stderr so they never interleave with frames. The
//! process exits cleanly when stdin closes.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{stdin, stdout, BufReader, BufWriter};
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

use chart_common::protocol::{read_frame, write_frame, ProtocolError, RenderRequest, ResponseHeader, WorkerErrorKind};
use chart_common::RenderError;

#[derive(Parser, Debug)]
#[command(name = "renderer-worker")]
#[command(about = "Chart render worker driven over stdin/stdout")]
struct Args {
    /// Log level
    #[arg(long, env = "RENDER_WORKER_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!(pid = std::process::id(), "Render worker started");

    let mut input = BufReader::new(stdin());
    let mut output = BufWriter::new(stdout());
    let mut served: u64 = 0;

    loop {
        let (request, _payload): (RenderRequest, Vec<u8>) = match read_frame(&mut input).await {
            Ok(frame) => frame,
            Err(ProtocolError::Closed) => break,
            Err(e) => {
                error!(error = %e, "Unreadable request frame");
                return Err(e).context("reading request frame");
            }
        };

        let task_id = request.task_id;
        // A panic here surfaces as an error from main; the pool sees the
        // closed stream and treats it as a crash.
        let rendered = tokio::task::spawn_blocking(move || renderer::render_chart(&request.series, &request.options))
            .await
            .context("render task panicked")?;

        match rendered {
            Ok(png) => {
                debug!(task_id = %task_id, bytes = png.len(), "Rendered chart");
                write_frame(&mut output, &ResponseHeader::Ok { task_id }, &png).await?;
            }
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Render rejected");
                let (kind, message) = match e {
                    RenderError::InvalidPayload(message) => (WorkerErrorKind::InvalidPayload, message),
                    RenderError::Encode(message) => (WorkerErrorKind::Encode, message),
                    other => (WorkerErrorKind::Encode, other.to_string()),
                };
                let header = ResponseHeader::Error { task_id, kind, message };
                write_frame(&mut output, &header, &[]).await?;
            }
        }
        served += 1;
    }

    info!(served = served, "Input closed, render worker exiting");
    Ok(())
}
