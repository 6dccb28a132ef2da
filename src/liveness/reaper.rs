//! Reaper: crash recovery for dead workers and expired claims.
//!
//! The reaper runs independently of the worker pool. Each sweep removes
//! workers whose liveness lease expired and returns their Owned tasks to
//! the claimable set, then releases any task whose own `claim_deadline`
//! has passed even though its owner still heartbeats.
//!
//! Reaping races against late completion/failure reports from the very
//! worker being reaped. The store's owner-match guard resolves the race:
//! whichever side commits first wins, and the loser's report comes back as
//! a conflict rather than being applied.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::{RegistryError, WorkerRegistry};
use crate::metrics::MetricsCollector;
use crate::store::{StoreError, TaskStore};

/// Errors that can occur during a reaper sweep.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// The task store could not be reached or updated.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The liveness registry could not be reached or updated.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// What one sweep found and fixed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Workers whose lease had expired and were removed.
    pub reaped_workers: usize,
    /// Tasks those workers were holding, returned to Claimable.
    pub reclaimed_tasks: usize,
    /// Tasks released because their own claim deadline passed.
    pub expired_claims: usize,
}

/// Periodic sweep over the liveness registry and the task store.
pub struct Reaper {
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn WorkerRegistry>,
    interval: Duration,
    metrics: MetricsCollector,
}

impl Reaper {
    /// Creates a reaper sweeping every `interval`.
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<dyn WorkerRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            interval,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs one sweep.
    ///
    /// The registry delete and the task reclaim are two atomic operations,
    /// registry first: after the delete a late heartbeat gets
    /// `UnknownWorker`, and a late task report loses to the owner-match
    /// guard once the reclaim lands.
    pub async fn sweep(&self) -> Result<ReapSummary, ReaperError> {
        let mut summary = ReapSummary::default();

        let expired = self.registry.remove_expired().await?;
        summary.reaped_workers = expired.len();

        for worker in &expired {
            let reclaimed = self.store.reclaim_owned_by(&worker.worker_id).await?;
            summary.reclaimed_tasks += reclaimed;
            warn!(
                worker_id = %worker.worker_id,
                reclaimed = reclaimed,
                lease_expired_at = %worker.lease_expires_at,
                "Reaped dead worker"
            );
        }

        summary.expired_claims = self.store.release_expired_claims().await?;
        if summary.expired_claims > 0 {
            info!(
                released = summary.expired_claims,
                "Released tasks with expired claim deadlines"
            );
        }

        self.metrics
            .record_reap(summary.reaped_workers, summary.reclaimed_tasks + summary.expired_claims);

        Ok(summary)
    }

    /// Spawns the sweep loop. Runs until the shutdown channel fires.
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it so a fresh engine
            // does not sweep before anything has had a chance to register.
            ticker.tick().await;

            info!(interval_secs = self.interval.as_secs(), "Reaper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep().await {
                            Ok(summary) => {
                                debug!(
                                    reaped_workers = summary.reaped_workers,
                                    reclaimed_tasks = summary.reclaimed_tasks,
                                    expired_claims = summary.expired_claims,
                                    "Reaper sweep finished"
                                );
                            }
                            Err(e) => {
                                // Infrastructure trouble; the next tick
                                // retries the sweep.
                                warn!(error = %e, "Reaper sweep failed");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Reaper stopped");
                        break;
                    }
                }
            }
        })
    }
}
