//! tq-worker: execution side of the conversion queue.
//!
//! [`WorkerPool`] drains the job store with a fixed number of workers and
//! recovers stalled jobs; [`QueueController`] is the producer and admin
//! surface. [`start`] wires both to SQLite and ffmpeg and runs until a
//! shutdown signal arrives.

pub mod context;
pub mod controller;
pub mod finalize;
pub mod pool;

pub use context::QueueContext;
pub use controller::QueueController;
pub use finalize::sync_media;
pub use pool::{recover_stalled, InFlightJob, WorkerPool};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tq_av::{FfmpegTranscoder, ToolRegistry};
use tq_core::config::Config;
use tq_db::{DbPool, SqliteJobStore, SqliteMediaStore, StoreOptions};

/// Open the store, discover tools and assemble a [`QueueContext`].
pub fn build_context(config: Config) -> tq_core::Result<QueueContext> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    let db_path = &config.store.db_path;
    let existed = db_path.exists();
    let db = tq_db::init_pool(db_path)?;
    if existed {
        tracing::info!("Database opened (existing) at {}", db_path.display());
    } else {
        tracing::info!("Database created (new) at {}", db_path.display());
    }

    let tools = ToolRegistry::discover(&config.tools);
    for info in tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::warn!("Tool not found: {}; conversions will fail until it is installed", info.name);
        }
    }

    Ok(assemble(config, db, tools))
}

/// Build a [`QueueContext`] on an already opened database.
///
/// Tools are resolved but not version-checked, which keeps short-lived admin
/// commands quiet.
pub fn context_with_pool(config: Config, db: DbPool) -> QueueContext {
    let tools = ToolRegistry::discover(&config.tools);
    assemble(config, db, tools)
}

fn assemble(config: Config, db: DbPool, tools: ToolRegistry) -> QueueContext {
    let transcoder = FfmpegTranscoder::new(tools, config.transcoder.clone())
        .with_timeout(config.queue.job_timeout());
    let jobs = SqliteJobStore::new(db.clone(), StoreOptions::from(&config.queue));
    let media = SqliteMediaStore::new(db);

    QueueContext::new(config, Arc::new(jobs), Arc::new(media), Arc::new(transcoder))
}

/// Run the worker pool until SIGINT/SIGTERM or `cancel` fires.
pub async fn start(config: Config, cancel: CancellationToken) -> tq_core::Result<()> {
    let ctx = build_context(config)?;

    match ctx.jobs.stats() {
        Ok(stats) => tracing::info!(
            waiting = stats.waiting,
            active = stats.active,
            delayed = stats.delayed,
            completed = stats.completed,
            failed = stats.failed,
            paused = stats.paused,
            "Queue state at startup"
        ),
        Err(e) => tracing::warn!("Could not read queue stats: {e}"),
    }

    let pool = WorkerPool::new(ctx);
    pool.start().await?;

    shutdown_signal(cancel).await;

    pool.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM) or cancellation.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
