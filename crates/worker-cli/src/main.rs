// ============================================================================
// grid-worker: worker node for a distributed engine-training grid
// ============================================================================
// Usage:
//   grid-worker [run] --user NAME --password PW     Fetch and run tasks forever
//   grid-worker probe                               Show engine backends
//   grid-worker bestmove -w NET --moves "e2e4"      One interactive search
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use worker_core::config::{DEFAULT_SERVER_URL, TEST_SERVER_URL};
use worker_core::engine::{EngineMode, EngineSession, LaunchArgs, Weights};
use worker_core::pgn::LongAlgebraicPgn;
use worker_core::{BackendState, HttpGridServer, Settings, TaskLoop, WorkerConfig};

/// Grid worker: plays training and match games for the grid server
#[derive(Parser)]
#[command(name = "grid-worker", version, about = "Contribute engine games to a training grid")]
struct Cli {
    #[command(flatten)]
    opts: WorkerOpts,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and run tasks until stopped (default)
    Run,

    /// Probe the engine and print the backend it would be launched with
    Probe,

    /// Run one interactive search and print the best move
    Bestmove {
        /// Network weights file
        #[arg(short, long)]
        weights: PathBuf,

        /// Moves from the start position, space separated
        #[arg(long, default_value = "")]
        moves: String,

        /// Node budget for the search
        #[arg(long, default_value = "800")]
        nodes: u64,

        /// Seconds to wait for the best move
        #[arg(long, default_value = "60")]
        timeout: u64,
    },
}

#[derive(Args)]
struct WorkerOpts {
    /// Address of the grid server
    #[arg(long, global = true)]
    hostname: Option<String>,

    /// Username (falls back to GRID_WORKER_USER and settings.json)
    #[arg(long, global = true, default_value = "")]
    user: String,

    /// Password (falls back to GRID_WORKER_PASSWORD and settings.json)
    #[arg(long, global = true, default_value = "")]
    password: String,

    /// GPU index to use
    #[arg(long, global = true)]
    gpu: Option<u32>,

    /// Backend options passed to the engine verbatim, skipping autodetection
    #[arg(long, global = true)]
    backend_opts: Option<String>,

    /// Self-play parallelism
    #[arg(long, global = true)]
    parallelism: Option<u32>,

    /// Use the test server instead of the production one
    #[arg(long, global = true)]
    use_test_server: bool,

    /// Training run number to contribute to
    #[arg(long = "run", global = true, default_value = "0")]
    run_id: u32,

    /// Never delete cached networks
    #[arg(long, global = true)]
    keep: bool,

    /// Only run training games (default: on when no GPU backend is found)
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    train_only: Option<bool>,

    /// Report this machine's hostname to the server
    #[arg(long, global = true)]
    report_host: bool,

    /// Report the GPU name the engine detects
    #[arg(long, global = true)]
    report_gpu: bool,

    /// Name reported to the server for this machine
    #[arg(long, global = true, default_value = "")]
    localhost: String,

    /// Path to the engine binary
    #[arg(long, global = true)]
    engine: Option<PathBuf>,

    /// Extra engine arguments, space separated
    #[arg(long, global = true, default_value = "")]
    engine_args: String,
}

impl WorkerOpts {
    fn to_config(&self) -> WorkerConfig {
        let server_url = match &self.hostname {
            Some(host) => host.clone(),
            None if self.use_test_server => TEST_SERVER_URL.to_string(),
            None => DEFAULT_SERVER_URL.to_string(),
        };

        let mut config = WorkerConfig {
            server_url,
            user: or_env(&self.user, "GRID_WORKER_USER"),
            password: or_env(&self.password, "GRID_WORKER_PASSWORD"),
            local_host: self.localhost.clone(),
            engine_args: self.engine_args.split_whitespace().map(String::from).collect(),
            backend_opts: self.backend_opts.clone(),
            gpu: self.gpu,
            parallelism: self.parallelism,
            run_id: self.run_id,
            keep: self.keep,
            train_only: self.train_only,
            report_gpu: self.report_gpu,
            ..Default::default()
        };
        if let Some(engine) = &self.engine {
            config.engine = engine.clone();
        }
        config
    }
}

fn or_env(value: &str, var: &str) -> String {
    if value.is_empty() {
        std::env::var(var).unwrap_or_default()
    } else {
        value.to_string()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grid_worker=info".parse()?)
                .add_directive("worker_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.opts.to_config();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(config, cli.opts.report_host).await,
        Commands::Probe => cmd_probe(config).await,
        Commands::Bestmove {
            weights,
            moves,
            nodes,
            timeout,
        } => cmd_bestmove(config, weights, &moves, nodes, Duration::from_secs(timeout)).await,
    }
}

async fn probe_backend(config: &WorkerConfig) -> Result<BackendState> {
    let capabilities = BackendState::probe(&config.engine)
        .await
        .with_context(|| format!("Failed to run engine {}", config.engine.display()))?;
    Ok(BackendState::new(
        capabilities,
        config.backend_opts.clone(),
        config.gpu,
    )?)
}

async fn cmd_run(mut config: WorkerConfig, report_host: bool) -> Result<()> {
    let settings = Settings::discover()?;
    config.apply_settings(settings.as_ref(), report_host)?;
    config.validate()?;

    info!("Starting grid worker {} against {}", env!("CARGO_PKG_VERSION"), config.server_url);
    let backend = probe_backend(&config).await?;
    let meta = config.client_meta(&backend);
    let server = Arc::new(HttpGridServer::new(&config.server_url));

    let mut task_loop = TaskLoop::new(config, server, backend, meta)?;
    let shutdown = task_loop.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping the running engine and shutting down");
            shutdown.cancel();
        }
    });

    task_loop.run().await?;
    Ok(())
}

async fn cmd_probe(config: WorkerConfig) -> Result<()> {
    let backend = probe_backend(&config).await?;
    let (choice, backend_opts) = backend.choose_args();

    println!("=== Engine Backends ===");
    println!("Engine: {}", config.engine.display());
    for capability in backend.capabilities().iter() {
        println!("  {}", capability);
    }
    println!();
    println!("Chosen:     {:?}", choice);
    println!("Launch arg: {}", backend_opts.as_deref().unwrap_or("(none)"));
    println!("Train only: {}", config.effective_train_only(&backend));
    Ok(())
}

async fn cmd_bestmove(
    config: WorkerConfig,
    weights: PathBuf,
    moves: &str,
    nodes: u64,
    timeout: Duration,
) -> Result<()> {
    let mut backend = probe_backend(&config).await?;
    backend.ensure_sanity_checked(&config.engine, &weights).await?;

    let (_, backend_opts) = backend.choose_args();
    let mut launch = LaunchArgs::new(EngineMode::Uci, Weights::Single(weights));
    launch.extra = config.engine_args.clone();
    launch.backend_opts = backend_opts;

    let mut session = EngineSession::launch(&config.engine, &launch, Arc::new(LongAlgebraicPgn))?;
    let moves: Vec<String> = moves.split_whitespace().map(String::from).collect();
    session.position(&moves).await?;
    session.go(nodes).await?;

    let result = session.wait_best_move(timeout).await;
    session.kill().await?;
    println!("{}", result?);
    Ok(())
}
