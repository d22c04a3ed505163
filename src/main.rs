//! reactor-saga - telemetry aggregation and load-following saga initiation
//!
//! # Usage
//!
//! ```bash
//! # Create the keyspace once
//! reactor-saga init-schema
//!
//! # Consume from the broker telemetry endpoint, publish to the command endpoint
//! reactor-saga
//!
//! # Pipe the simulator in, print commands on stdout
//! reactor-sim --scenario mixed | reactor-saga --stdin --stdout-commands
//!
//! # Replay a JSON-lines capture at 10ms per reading
//! reactor-saga --replay capture.jsonl --delay-ms 10
//! ```
//!
//! # Environment Variables
//!
//! - `REACTOR_SAGA_CONFIG`: path to the TOML config (default: ./reactor_saga.toml)
//! - `RUST_LOG`: logging level (default: info)
//! - `RESET_DB`: set to "true" to wipe the keyspace on startup (for testing)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use reactor_saga::api::{create_app, ApiState, EngineInfo};
use reactor_saga::config::{defaults, EngineConfig};
use reactor_saga::metrics::EngineMetrics;
use reactor_saga::pipeline::{
    IngestLoop, InputKind, OffsetCommitter, PartitionedRuntime, ReplaySource, RuntimeDeps,
    RuntimeSettings, StdinSource, TcpSource, TelemetrySource,
};
use reactor_saga::saga::{CommandPublisher, StdoutPublisher, TcpPublisher};
use reactor_saga::storage::{DurableStore, OffsetStore, SinkAdapter, SledStore};
use reactor_saga::transport::LineClient;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "reactor-saga")]
#[command(about = "Windowed telemetry aggregation and deviation-triggered saga initiation")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file
    #[arg(short, long, env = "REACTOR_SAGA_CONFIG")]
    config: Option<PathBuf>,

    /// Read telemetry JSON lines from stdin instead of the broker
    /// Use with the simulator: reactor-sim | reactor-saga --stdin
    #[arg(long, conflicts_with = "replay")]
    stdin: bool,

    /// Replay a JSON-lines file, resuming after its committed offset
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Delay between replayed readings in milliseconds (0 = no delay)
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Override the broker telemetry endpoint (HOST:PORT)
    #[arg(long, value_name = "HOST:PORT")]
    telemetry_endpoint: Option<String>,

    /// Override the broker command endpoint (HOST:PORT)
    #[arg(long, value_name = "HOST:PORT")]
    command_endpoint: Option<String>,

    /// Write saga commands to stdout instead of the broker
    #[arg(long)]
    stdout_commands: bool,

    /// Override the HTTP server address (default: "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Wipe the keyspace on startup.
    /// WARNING: This is destructive and cannot be undone!
    /// Can also be set via RESET_DB=true environment variable.
    #[arg(long)]
    reset_db: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Create the keyspace tables and schema marker, then exit
    InitSchema,
    /// Print the effective configuration as TOML, then exit
    PrintConfig,
}

// ============================================================================
// Database Reset
// ============================================================================

/// Check if database reset is requested via CLI flag or environment variable.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    std::env::var("RESET_DB")
        .map(|val| matches!(val.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

fn reset_keyspace(path: &Path) -> Result<()> {
    if !path.exists() {
        info!(path = %path.display(), "Keyspace does not exist, nothing to reset");
        return Ok(());
    }
    warn!(path = %path.display(), "RESET_DB requested, wiping keyspace");
    std::fs::remove_dir_all(path)
        .with_context(|| format!("Failed to remove keyspace {}", path.display()))?;
    SledStore::init_schema(path).context("Failed to recreate schema after reset")?;
    Ok(())
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    Ingest,
    OffsetCommitter,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::Ingest => write!(f, "Ingest"),
            TaskName::OffsetCommitter => write!(f, "OffsetCommitter"),
        }
    }
}

// ============================================================================
// Engine Assembly
// ============================================================================

/// Everything a source needs around it, built once before the source.
struct EngineCore {
    config: EngineConfig,
    store: Arc<SledStore>,
    metrics: Arc<EngineMetrics>,
    publisher: Arc<dyn CommandPublisher>,
    listener: tokio::net::TcpListener,
}

async fn init_engine(config: EngineConfig, stdout_commands: bool) -> Result<EngineCore> {
    // Missing schema is fatal unless explicitly allowed
    let store = SledStore::open(&config.sink.path, config.sink.create_schema)
        .with_context(|| format!("Opening keyspace {}", config.sink.path.display()))?;
    info!(
        path = %store.path().display(),
        aggregates = store.aggregate_count(),
        saga_rows = store.saga_log_count(),
        "Keyspace ready"
    );

    let metrics = Arc::new(EngineMetrics::new(config.runtime.partition_count));

    let publisher: Arc<dyn CommandPublisher> = if stdout_commands {
        Arc::new(StdoutPublisher::new())
    } else {
        Arc::new(TcpPublisher::new(
            &config.broker.command_endpoint,
            &config.broker.command_topic,
            Duration::from_secs(defaults::CONNECT_TIMEOUT_SECS),
        ))
    };
    info!(transport = publisher.transport_name(), "Command transport configured");

    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", config.server.addr))?;
    info!(addr = %config.server.addr, "HTTP API listening");

    Ok(EngineCore {
        config,
        store: Arc::new(store),
        metrics,
        publisher,
        listener,
    })
}

/// First offset to deliver for `input` (committed position for replays, 0 otherwise).
fn start_offset(store: &SledStore, input: &InputKind) -> Result<u64> {
    input
        .resume_offset(store)
        .with_context(|| format!("Loading committed offset for {}", input.source_name()))
}

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
///
/// Unlike a pure server, the engine finishes when its source does, so the
/// loop keeps joining after cancellation until every task has drained.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    let mut failure = None;
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!("Supervisor: task {} completed", task_name),
            Ok(Err(e)) => {
                error!("Supervisor: task failed: {:#}", e);
                cancel_token.cancel();
                failure.get_or_insert(e);
            }
            Err(e) => {
                error!("Supervisor: task panicked: {}", e);
                cancel_token.cancel();
                failure.get_or_insert(anyhow::anyhow!("Task panicked: {}", e));
            }
        }
    }
    info!("Supervisor: all tasks completed");

    failure.map_or(Ok(()), Err)
}

// ============================================================================
// Unified Engine Runner
// ============================================================================

/// Run the engine with any telemetry source.
///
/// All input modes (broker TCP, stdin, replay) flow through this function.
async fn run_engine<S: TelemetrySource>(
    mut source: S,
    core: EngineCore,
    cancel_token: CancellationToken,
) -> Result<()> {
    let EngineCore {
        config,
        store,
        metrics,
        publisher,
        listener,
    } = core;

    let settings = RuntimeSettings::from_config(&config).context("Invalid window geometry")?;
    let restored = store
        .started_sagas()
        .await
        .context("Reading saga log for cooldown restore")?;

    let offset_store: Arc<dyn OffsetStore> = store.clone();
    let offsets = OffsetCommitter::new(
        source.source_name(),
        source.start_offset(),
        Some(offset_store),
        metrics.clone(),
    );
    let durable: Arc<dyn DurableStore> = store.clone();
    let deps = RuntimeDeps {
        bands: Arc::new(config.band_registry()),
        publisher: publisher.clone(),
        sink: SinkAdapter::new(durable, config.sink_write_timeout(), metrics.clone()),
        offsets: offsets.clone(),
        metrics: metrics.clone(),
    };

    let info = EngineInfo::from_config(
        &config,
        source.source_name(),
        publisher.transport_name(),
        store.backend_name(),
    );
    let app = create_app(ApiState::new(metrics.clone(), info));

    info!("Supervisor: initializing task monitoring");
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task 1: HTTP Server
    spawn_http_server(&mut task_set, listener, app, cancel_token.clone());

    // Task 2: Periodic offset commits
    let commit_interval = Duration::from_millis(config.runtime.commit_interval_ms);
    let commit_cancel = cancel_token.clone();
    task_set.spawn(async move {
        offsets.run(commit_interval, commit_cancel).await;
        Ok(TaskName::OffsetCommitter)
    });

    // Task 3: Ingest, then drain the runtime. Ends the process when the
    // source is exhausted.
    let runtime = PartitionedRuntime::start(&settings, deps, &restored, cancel_token.clone());
    let ingest_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[Ingest] Task starting");
        let ingest = IngestLoop::new(runtime, metrics, ingest_cancel.clone());
        let stats = ingest.run(&mut source).await;
        let report = ingest.into_runtime().shutdown().await;
        info!(
            submitted = stats.submitted,
            rejected = stats.rejected,
            end = ?stats.end,
            committed_offset = report.committed_offset,
            outstanding = report.outstanding,
            "[Ingest] Runtime drained"
        );
        ingest_cancel.cancel();
        Ok(TaskName::Ingest)
    });

    run_supervisor(&mut task_set, cancel_token).await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn load_config(args: &CliArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("Loading config {}", path.display()))?,
        None => EngineConfig::load(),
    };
    if let Some(endpoint) = &args.telemetry_endpoint {
        config.broker.telemetry_endpoint.clone_from(endpoint);
    }
    if let Some(endpoint) = &args.command_endpoint {
        config.broker.command_endpoint.clone_from(endpoint);
    }
    if let Some(addr) = &args.addr {
        config.server.addr.clone_from(addr);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout may carry commands
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    // Subcommand dispatch
    match args.command {
        Some(SubCommand::InitSchema) => {
            SledStore::init_schema(&config.sink.path).with_context(|| {
                format!("Creating schema in {}", config.sink.path.display())
            })?;
            info!(path = %config.sink.path.display(), "Schema ready");
            return Ok(());
        }
        Some(SubCommand::PrintConfig) => {
            println!("{}", config.to_toml()?);
            return Ok(());
        }
        None => {}
    }

    // Reset DB check, BEFORE any storage initialization
    if should_reset_db(args.reset_db) {
        reset_keyspace(&config.sink.path)?;
    }

    info!(
        lanes = config.runtime.partition_count,
        window_size_secs = config.window.size_secs,
        window_step_secs = config.window.step_secs,
        default_class = %config.detection.default_class,
        "reactor-saga starting"
    );

    let core = init_engine(config, args.stdout_commands).await?;

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    // Dispatch to the unified runner with the appropriate source
    if let Some(path) = &args.replay {
        let start = start_offset(&core.store, &InputKind::Replay(path.clone()))?;
        info!(path = %path.display(), delay_ms = args.delay_ms, "Input: replay file");
        let source = ReplaySource::open(path, start, core.metrics.clone())
            .await?
            .with_delay(Duration::from_millis(args.delay_ms));
        run_engine(source, core, cancel_token).await?;
    } else if args.stdin {
        start_offset(&core.store, &InputKind::Stdin)?;
        info!("Input: stdin (JSON lines)");
        let source = StdinSource::stdin(core.metrics.clone());
        run_engine(source, core, cancel_token).await?;
    } else {
        let broker = &core.config.broker;
        start_offset(
            &core.store,
            &InputKind::Broker {
                endpoint: broker.telemetry_endpoint.clone(),
                topic: broker.telemetry_topic.clone(),
            },
        )?;
        info!(endpoint = %broker.telemetry_endpoint, topic = %broker.telemetry_topic, "Input: broker TCP");
        let client = LineClient::new(broker.telemetry_endpoint.clone())
            .with_read_timeout(Duration::from_secs(defaults::READ_TIMEOUT_SECS))
            .with_max_reconnect_attempts(defaults::MAX_RECONNECT_ATTEMPTS);
        let source = TcpSource::connect(client, &broker.telemetry_topic, core.metrics.clone())
            .await
            .context("Connecting to broker telemetry endpoint")?;
        run_engine(source, core, cancel_token).await?;
    }

    info!("reactor-saga shutdown complete");
    Ok(())
}
