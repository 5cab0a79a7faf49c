//! Background repair of open cascade sagas.
//!
//! A saga stays open when the process dies mid-cascade, when a repository
//! call times out during compensation, or when compensation itself fails.
//! The worker picks such sagas up once they have been idle for
//! `stale_after` and re-drives them through
//! [`SchedulingEngine::repair_saga`].

use std::sync::Arc;
use std::time::Duration;

use hermes_id::SagaId;
use hermes_reconcile::{
    RepairStatus, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_REPAIR_INTERVAL, DEFAULT_RETRY_WINDOW,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::engine::SchedulingEngine;
use super::error::SchedulingResult;

/// Repair worker configuration.
#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Time between passes.
    pub interval: Duration,

    /// Minimum idle time before an open saga is considered abandoned.
    pub stale_after: Duration,

    /// Failed repairs per saga (inside `retry_window`) before it is
    /// escalated and skipped.
    pub max_attempts: u32,

    pub retry_window: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REPAIR_INTERVAL,
            stale_after: Duration::from_secs(60),
            max_attempts: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
        }
    }
}

/// Counters from one repair pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairStats {
    pub examined: usize,
    pub converged: usize,
    pub converging: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct RepairWorker {
    engine: Arc<SchedulingEngine>,
    config: RepairConfig,
    tracker: RetryTracker<SagaId>,
}

impl RepairWorker {
    pub fn new(engine: Arc<SchedulingEngine>, config: RepairConfig) -> Self {
        let tracker = RetryTracker::new(config.max_attempts, config.retry_window);
        Self {
            engine,
            config,
            tracker,
        }
    }

    /// Run passes until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Starting repair worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.repair_pending().await {
                        Ok(stats) if stats.examined > 0 => info!(
                            examined = stats.examined,
                            converged = stats.converged,
                            converging = stats.converging,
                            failed = stats.failed,
                            skipped = stats.skipped,
                            "Repair pass complete"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Repair pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Repair worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single pass over every open saga idle for `stale_after`.
    pub async fn repair_pending(&mut self) -> SchedulingResult<RepairStats> {
        self.tracker.prune();
        let sagas = self.engine.pending_sagas(self.config.stale_after).await?;
        let mut stats = RepairStats::default();

        for saga in sagas {
            stats.examined += 1;
            if self.tracker.is_exhausted(&saga.id) {
                debug!(saga_id = %saga.id, "Skipping saga with exhausted retries");
                stats.skipped += 1;
                continue;
            }

            match self.engine.repair_saga(saga.id).await {
                Ok(RepairStatus::Converged) => {
                    self.tracker.clear(&saga.id);
                    stats.converged += 1;
                }
                Ok(_) => {
                    stats.converging += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    if self.tracker.record_failure(&saga.id) {
                        error!(
                            saga_id = %saga.id,
                            user_id = %saga.user,
                            failures = self.tracker.failures(&saga.id),
                            error = %e,
                            "Saga repair keeps failing, escalating"
                        );
                    } else {
                        warn!(saga_id = %saga.id, error = %e, "Saga repair failed, will retry");
                    }
                }
            }
        }
        Ok(stats)
    }
}
