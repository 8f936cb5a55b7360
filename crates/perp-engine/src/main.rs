//! perp-engine: derivatives strategy engine.
//!
//! Usage:
//!   perp-engine [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Config file path (default: config/engine.toml)
//!   --log-level <LEVEL>    Override the configured log level

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use perp_engine::config::EngineConfig;
use perp_engine::db::{PgStore, StrategyStore};
use perp_engine::exchange::binance::BinanceFactory;
use perp_engine::exchange::ws::BinanceTradeConnector;
use perp_engine::feed::MarkFeed;
use perp_engine::notify::new_notifier;
use perp_engine::shutdown::ShutdownCoordinator;
use perp_engine::server;
use perp_engine::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "perp-engine")]
#[command(about = "Derivatives strategy engine")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/engine.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    let args = Args::parse();
    let mut config = if args.config.exists() {
        EngineConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {:?}", args.config))?
    } else {
        EngineConfig::default()
    };
    config.apply_env_overrides();
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate()?;

    init_logging(&config)?;
    info!(environment = %config.environment, "starting perp-engine");

    // External collaborators.
    let store: Arc<dyn StrategyStore> = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("failed to connect to the database")?,
    );
    let notifier = new_notifier(&config.notifier_platform, &config.notifier_token)
        .context("failed to build the notifier")?;
    let factory = Arc::new(BinanceFactory::new());

    // Supervisor: event loop plus every enabled strategy.
    let supervisor = Supervisor::new(store.clone(), notifier, factory);
    supervisor
        .start()
        .await
        .context("failed to start strategies")?;

    // Feed over the enabled symbol set.
    let symbols: Vec<String> = store
        .enabled_symbols()
        .await
        .context("failed to load symbols")?
        .into_iter()
        .map(|s| s.name)
        .collect();
    if symbols.is_empty() {
        bail!("there is no enabled symbol");
    }
    let feed = MarkFeed::new(
        Arc::new(BinanceTradeConnector::new()),
        supervisor.index(),
        symbols,
    );
    let feed_stop = feed.stop_handle();
    let feed_task = tokio::spawn(feed.run());

    // Admin surface.
    let (http_stop, mut http_stop_rx) = broadcast::channel::<()>(1);
    let http_supervisor = supervisor.clone();
    let http_port = config.http_port;
    let http_task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = http_stop_rx.recv().await;
        };
        if let Err(e) = server::serve(http_supervisor, http_port, shutdown).await {
            warn!(error = %e, "admin server exited with error");
        }
    });

    // Block until a signal, then staged teardown with ceilings.
    ShutdownCoordinator {
        http_stop,
        http_task,
        feed_stop,
        feed_task,
        supervisor,
    }
    .run()
    .await;

    Ok(())
}

fn init_logging(config: &EngineConfig) -> Result<()> {
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path:?}"))?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}
