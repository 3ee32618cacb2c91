#![allow(dead_code)]

mod errors;
mod layers;
mod models;
mod routers;
mod services;
mod utils;

use crate::errors::ReelError;
use crate::routers::router;
use clap::Parser;
use services::chunk_store::ChunkStore;
use services::states::ReelState;
use services::states::cache::CacheState;
use services::states::config::AppConfig;
use services::states::db::DataBaseState;
use services::transcoder::{Encoder, TranscoderHandle};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// How long in-flight renditions may keep running once the server stops.
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the connection pool gets to settle on exit.
const DB_CLOSE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(clap::Parser, Debug)]
#[clap(name = "reel", version)]
pub struct Cli {
    #[clap(short, long, help = "Path to config file", default_value = "reel.toml")]
    config: String,
}

/// Resolves once the process is asked to stop: SIGINT or SIGTERM on Unix,
/// ctrl-c elsewhere.
async fn stop_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::warn!("stop requested, finishing in-flight requests");
}

/// Shutdown tail: seal the transcode queue so no new work lands, give the
/// workers a bounded window to finish what they already hold, then close the
/// database pool.
async fn drain(state: &Arc<ReelState>, workers: Vec<JoinHandle<()>>) {
    state.transcoder.close();
    let workers_done = async {
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "transcode worker panicked while draining");
            }
        }
    };
    if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, workers_done)
        .await
        .is_err()
    {
        tracing::warn!(
            timeout = ?WORKER_DRAIN_TIMEOUT,
            "transcode workers still busy, abandoning drain"
        );
    }
    match tokio::time::timeout(DB_CLOSE_TIMEOUT, state.db.close_conn()).await {
        Ok(()) => tracing::info!("database pool closed"),
        Err(_) => tracing::error!("database pool did not close in time"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load(&cli.config)?);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&*config.common.log_level))
        .init();
    let sqlx_opt = SqliteConnectOptions::from_str(&config.db.db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let sqlx_pool = SqlitePoolOptions::new()
        .max_connections(config.db.sqlite_connection_nums)
        .connect_with(sqlx_opt)
        .await
        .map_err(ReelError::Sqlx)?;
    tracing::info!("running embedded migrations");
    sqlx::migrate!("./migrations")
        .run(&sqlx_pool)
        .await
        .map_err(ReelError::Migrate)?;
    let db = DataBaseState::new(sqlx_pool);
    let cache = CacheState::new();
    let store = ChunkStore::new(config.storage.root.clone());
    store.init().await?;
    tracing::info!(root = %config.storage.root.display(), "storage ready");
    let encoder = Encoder::new(&config.transcode);
    let (transcoder, task_rx) = TranscoderHandle::channel(config.transcode.queue_capacity);
    let reel_state = Arc::new(ReelState {
        config: config.clone(),
        db,
        cache,
        store,
        encoder,
        transcoder,
    });
    services::transcoder::rehydrate(&reel_state).await?;
    let workers = services::transcoder::spawn_workers(
        reel_state.clone(),
        task_rx,
        config.transcode.workers,
    );
    let addr = format!("{}:{}", config.common.host, config.common.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(reel_state.clone()).await)
        .with_graceful_shutdown(stop_requested())
        .await?;
    drain(&reel_state, workers).await;
    Ok(())
}
