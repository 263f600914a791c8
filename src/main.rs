use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scrape_tracker::api::{self, AppState};
use scrape_tracker::config;
use scrape_tracker::db;
use scrape_tracker::executor::HttpScriptExecutor;
use scrape_tracker::generator::HttpPhaseGenerator;
use scrape_tracker::progress::MemoryProgressStore;
use scrape_tracker::runs::{RunService, RunSettings};
use scrape_tracker::sessions::SessionService;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Print an example configuration and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let executor = HttpScriptExecutor::new(
        &cfg.worker.url,
        Duration::from_secs(cfg.worker.timeout_secs),
    )?;
    let generator = HttpPhaseGenerator::new(
        &cfg.generator.url,
        cfg.generator.api_key.clone(),
        Duration::from_secs(cfg.generator.timeout_secs),
    )?;

    let runs = RunService::new(
        pool.clone(),
        Arc::new(MemoryProgressStore::new()),
        Arc::new(executor),
        RunSettings::from(&cfg.runs),
    );
    let sessions = SessionService::new(pool, Arc::new(generator));

    let shutdown = CancellationToken::new();
    let sweeper = runs.spawn_cache_sweeper(
        Duration::from_secs(cfg.runs.cache_sweep_interval_secs),
        Duration::from_secs(cfg.runs.cache_max_age_secs),
        shutdown.clone(),
    );

    let app = api::router(AppState { runs, sessions });
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.bind))?;
    info!(bind = %cfg.server.bind, "starting http server");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(?err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}
