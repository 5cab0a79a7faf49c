//! hermes enrollment service
//!
//! Owns the scheduling engine's storage and keeps it consistent: cascades
//! interrupted by a crash or a failed compensation are re-driven by the
//! repair worker until they settle.

use std::sync::Arc;

use anyhow::Result;
use hermes_enrollment::{
    config::{self, StoreBackend},
    db::Database,
    repository::{InMemoryRepository, SagaStore, SessionRepository},
    scheduling::{RepairWorker, SchedulingEngine},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to HERMES_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hermes enrollment service");
    info!(
        store = ?config.store,
        repo_timeout_ms = config.engine.repo_timeout.as_millis() as u64,
        max_adjust_retries = config.engine.max_adjust_retries,
        max_cascade_depth = config.engine.max_cascade_depth,
        "Configuration loaded"
    );

    let (sessions, sagas): (Arc<dyn SessionRepository>, Arc<dyn SagaStore>) = match config.store {
        StoreBackend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            db.health_check().await?;
            let sessions: Arc<dyn SessionRepository> = Arc::new(db.session_repository());
            let sagas: Arc<dyn SagaStore> = Arc::new(db.saga_store());
            (sessions, sagas)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; nothing survives a restart");
            let repo = Arc::new(InMemoryRepository::new());
            let sessions: Arc<dyn SessionRepository> = repo.clone();
            let sagas: Arc<dyn SagaStore> = repo;
            (sessions, sagas)
        }
    };

    let engine = Arc::new(SchedulingEngine::new(sessions, sagas, config.engine.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let repair_worker = RepairWorker::new(engine, config.repair.clone());
    let repair_handle = tokio::spawn(repair_worker.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, repair_handle)
        .await
        .is_err()
    {
        warn!("Repair worker did not shut down in time");
    }

    info!("Enrollment service shutdown complete");
    Ok(())
}
