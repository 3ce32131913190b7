use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

mod config;
mod db;
mod error;
mod live_scores;
mod sync;
#[cfg(test)]
mod testing;

use config::Config;
use db::Database;
use error::SyncError;
use live_scores::HttpScoreProvider;
use sync::{LeaderLock, SyncLoop};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::parse();
    config.validate()?;

    // Both are present after validate()
    let database_path = config.database_path.clone().unwrap_or_default();
    let upstream_url = config.upstream_url.clone().unwrap_or_default();

    let db = Database::open(&database_path)
        .with_context(|| format!("failed to open database {}", database_path))?;
    info!(
        "Database opened: {} ({} cached games)",
        database_path,
        db.cached_game_count()?
    );

    let provider = HttpScoreProvider::new(
        &upstream_url,
        config.upstream_token.clone(),
        config.sync_settings().fetch_timeout,
    )?;

    let owner = config.owner_id();
    info!("Instance id: {}", owner);
    let store = Arc::new(db);
    let lock = LeaderLock::new(store.clone(), config.lock_config(owner));
    let sync = SyncLoop::new(
        Arc::new(provider),
        store,
        lock,
        config.sync_settings(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    match sync.run(shutdown_rx).await {
        Ok(stats) => {
            info!(
                "Exiting after {} ticks, {} games written",
                stats.ticks, stats.records_written
            );
            Ok(())
        }
        Err(e @ SyncError::LockLost { .. }) => {
            Err(anyhow::Error::new(e).context("stopping: another instance holds the leader lock"))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
