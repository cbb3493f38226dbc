use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use trendd::api;
use trendd::config::Config;
use trendd::export::health::HealthMetrics;
use trendd::model::personal::ColdTier;
use trendd::scheduler::Scheduler;
use trendd::service::StatisticService;
use trendd::storage::cold::ColdStorage;
use trendd::storage::file::FileManager;

/// In-memory trending-statistics daemon.
#[derive(Parser)]
#[command(name = "trendd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("trendd {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // A missing config file means defaults everywhere.
    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting trendd",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // 1. Core engine: service, cold tier, persistence driver.
    let service = Arc::new(StatisticService::new(&cfg.statistic));
    let cold = Arc::new(ColdStorage::new(cfg.cold_dir(), cfg.statistic.cold_ttl));
    service.set_cold_storage(Arc::clone(&cold) as Arc<dyn ColdTier>);
    let file_manager = Arc::new(FileManager::new(Arc::clone(&service)));

    // 2. Health metrics server, so probes respond before restore finishes.
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health
        .start()
        .await
        .context("starting health metrics server")?;

    // 3. Scheduler: restore persisted state, then start the tickers.
    let scheduler = Scheduler::new(
        Arc::clone(&service),
        file_manager,
        Arc::clone(&cold),
        Arc::clone(&health),
        cfg.persistence.file_path.clone(),
        cfg.statistic.interval,
        cfg.persistence.save_interval,
    );
    scheduler.restore().context("restoring persisted state")?;
    scheduler.start().await;

    // 4. Ingest/query API.
    let api_cancel = CancellationToken::new();
    api::serve(&cfg.server.addr, Arc::clone(&service), api_cancel.clone())
        .await
        .context("starting api server")?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown: stop intake, finish the current tick, persist.
    api_cancel.cancel();
    scheduler.stop().await;
    if let Err(e) = scheduler.persist().await {
        tracing::error!(error = %e, "final persist failed");
    }
    health.stop().await?;

    tracing::info!("trendd stopped");

    Ok(())
}
