use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod cli;
mod metrics;
mod rankings;
mod schedule;
mod sentiment;
mod verification;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    // CLI commands use sync Database — they exit immediately, no need for async.
    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    if cmd != cli::Command::Run {
        let mut db = common::db::Database::open(&config.database.path)?;
        db.run_migrations()?;
        cli::run_command(&mut db, cmd, config.badges.min_monthly_predictions)?;
        return Ok(());
    }

    tracing::info!("pulse server starting");

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    // Dedicated background thread for SQLite; all request handlers share it.
    let db = common::db::AsyncDb::open(&config.database.path).await?;

    if config.badges.scheduler_enabled {
        tokio::spawn(schedule::run_scheduler(db.clone(), config.badges));
    } else {
        tracing::info!("badge scheduler disabled, expecting external badge runs");
    }

    let state = Arc::new(api::AppState {
        db,
        server: config.server.clone(),
        badges: config.badges,
        verification: config.verification,
        started_at: chrono::Utc::now(),
    });

    let app = api::router(state);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
