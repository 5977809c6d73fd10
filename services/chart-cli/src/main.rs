//! Chart CLI.
//!
//! Loads activity records from a JSON snapshot, runs one chart request through
//! the pipeline and writes the PNG. Missing request parameters are filled the
//! same way a front end would fill them.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use chart_common::PipelineError;
use pipeline::{
    with_request_defaults, ChartPipeline, PipelineConfig, ProcessWorkerFactory, RawChartParams, RequestDefaults,
    ThreadWorkerFactory, WorkerFactory,
};
use storage::{CacheStore, MemoryRepository, MemoryStore, RedisStore};

/// Exit status for failures worth retrying (EX_TEMPFAIL).
const EXIT_RETRYABLE: u8 = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Render on dedicated threads inside this process
    Thread,
    /// Render in `renderer-worker` child processes
    Process,
}

#[derive(Parser, Debug)]
#[command(name = "chart-cli")]
#[command(about = "Render an activity chart from a record snapshot")]
struct Args {
    /// JSON record snapshot (`{"records": [...], "related": {...}}`)
    #[arg(short, long, env = "CHARTS_RECORDS")]
    records: PathBuf,

    /// Output PNG path
    #[arg(short, long)]
    output: PathBuf,

    /// Entity ids, repeated or comma-separated
    #[arg(short, long = "entity", required = true)]
    entities: Vec<String>,

    /// Range start (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    start: Option<String>,

    /// Range end, exclusive (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    end: Option<String>,

    /// hour, day or week
    #[arg(long)]
    grouping: Option<String>,

    #[arg(long)]
    metric: Option<String>,

    #[arg(long)]
    filter: Option<String>,

    /// Number of ranked datasets to keep
    #[arg(long)]
    limit: Option<String>,

    /// line, area, bar or stacked_bar
    #[arg(long)]
    kind: Option<String>,

    #[arg(long)]
    width: Option<String>,

    #[arg(long)]
    height: Option<String>,

    #[arg(long)]
    title: Option<String>,

    /// Redis cache; an in-memory cache is used when unset
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// In-memory cache budget in megabytes
    #[arg(long, env = "CHARTS_MEMORY_CACHE_MB", default_value = "64")]
    memory_cache_mb: usize,

    #[arg(long, env = "CHARTS_RENDER_BACKEND", value_enum, default_value = "thread")]
    backend: Backend,

    /// Worker binary for the process backend (default: next to this binary)
    #[arg(long, env = "CHARTS_WORKER_BIN")]
    worker_bin: Option<PathBuf>,

    /// Print pipeline metrics as JSON on stdout
    #[arg(long)]
    stats: bool,

    /// Print the Prometheus exposition on stderr before exiting
    #[arg(long)]
    prometheus: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

impl Args {
    fn params(&self) -> RawChartParams {
        RawChartParams {
            entities: self.entities.clone(),
            start: self.start.clone(),
            end: self.end.clone(),
            grouping: self.grouping.clone(),
            metric: self.metric.clone(),
            filter: self.filter.clone(),
            limit: self.limit.clone(),
            kind: self.kind.clone(),
            width: self.width.clone(),
            height: self.height.clone(),
            title: self.title.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

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

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            let retryable = e.downcast_ref::<PipelineError>().is_some_and(PipelineError::is_retryable);
            if retryable {
                ExitCode::from(EXIT_RETRYABLE)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let prometheus = if args.prometheus {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("installing Prometheus recorder")?,
        )
    } else {
        None
    };

    let config = PipelineConfig::from_env()?;
    let repository = Arc::new(MemoryRepository::load(&args.records)?);
    let store = open_store(&args).await?;
    let factory = worker_factory(&args)?;

    info!(
        records = %args.records.display(),
        backend = factory.backend(),
        redis = args.redis_url.is_some(),
        "Starting chart pipeline"
    );
    let pipeline = ChartPipeline::start(config, store, repository, factory).await?;

    let result = render(&pipeline, &args).await;
    if result.is_ok() && args.stats {
        println!("{}", serde_json::to_string_pretty(&pipeline.metrics())?);
    }
    pipeline.shutdown().await;

    if let Some(handle) = prometheus {
        eprint!("{}", handle.render());
    }
    result
}

async fn render(pipeline: &ChartPipeline, args: &Args) -> Result<()> {
    let image = with_request_defaults(args.params(), &RequestDefaults::default(), |request| async move {
        pipeline.get_chart(&request).await
    })
    .await?;

    write_image(&args.output, &image).await?;
    info!(output = %args.output.display(), bytes = image.len(), "Chart written");
    Ok(())
}

async fn open_store(args: &Args) -> Result<Arc<dyn CacheStore>> {
    match &args.redis_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => Ok(Arc::new(store)),
            Err(e) => {
                // The cache is an optimisation; fall back rather than fail.
                warn!(error = %e, "Redis unavailable, using in-memory cache");
                Ok(Arc::new(MemoryStore::new(args.memory_cache_mb, 10_000)))
            }
        },
        None => Ok(Arc::new(MemoryStore::new(args.memory_cache_mb, 10_000))),
    }
}

fn worker_factory(args: &Args) -> Result<Arc<dyn WorkerFactory>> {
    match args.backend {
        Backend::Thread => Ok(Arc::new(ThreadWorkerFactory::default())),
        Backend::Process => {
            let program = match &args.worker_bin {
                Some(path) => path.clone(),
                None => std::env::current_exe()
                    .context("locating chart-cli binary")?
                    .with_file_name("renderer-worker"),
            };
            if !program.exists() {
                error!(program = %program.display(), "Render worker binary not found");
            }
            Ok(Arc::new(ProcessWorkerFactory::new(program).arg(format!("--log-level={}", args.log_level))))
        }
    }
}

async fn write_image(path: &Path, image: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(path, image)
        .await
        .with_context(|| format!("writing {}", path.display()))
}
