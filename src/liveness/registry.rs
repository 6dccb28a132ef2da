//! Worker liveness registry.
//!
//! Workers register on startup, renew their lease on a heartbeat interval
//! and deregister on graceful shutdown. A worker whose lease expires
//! without renewal is considered dead and is removed by the reaper, which
//! then reclaims the tasks it was holding.
//!
//! The registry is deliberately a narrow component behind a trait: the
//! in-memory implementation serves single-node deployments and tests, and
//! a durable implementation can be substituted behind the same contract.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::clock::{chrono_duration, Clock, SystemClock};

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The worker is not registered (never was, or already reaped).
    #[error("Worker '{0}' is not registered")]
    UnknownWorker(String),

    /// The registry cannot currently serve requests.
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

/// A registered worker's liveness record.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Stable identifier for the worker process.
    pub worker_id: String,
    /// Task kinds this worker may claim; empty means any kind.
    pub capabilities: Vec<String>,
    /// When the worker first registered.
    pub registered_at: DateTime<Utc>,
    /// The worker is considered dead once this passes without renewal.
    pub lease_expires_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Returns whether the lease had expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at < now
    }
}

/// Liveness tracking for workers.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Registers a worker, or refreshes its lease and capabilities if it is
    /// already registered. Idempotent.
    async fn register(
        &self,
        worker_id: &str,
        capabilities: Vec<String>,
    ) -> Result<(), RegistryError>;

    /// Extends the worker's lease. Fails with `UnknownWorker` if the worker
    /// was already reaped, which tells the worker its tasks are gone and it
    /// must re-register.
    async fn renew(&self, worker_id: &str) -> Result<(), RegistryError>;

    /// Removes the worker record immediately. Idempotent; used during
    /// graceful shutdown.
    async fn deregister(&self, worker_id: &str) -> Result<(), RegistryError>;

    /// Fetches a worker's record.
    async fn get(&self, worker_id: &str) -> Result<Option<WorkerRecord>, RegistryError>;

    /// Atomically removes every worker whose lease has expired and returns
    /// the removed records. The reaper reclaims their tasks afterwards.
    async fn remove_expired(&self) -> Result<Vec<WorkerRecord>, RegistryError>;

    /// Lists all registered workers.
    async fn list(&self) -> Result<Vec<WorkerRecord>, RegistryError>;
}

/// In-memory implementation of [`WorkerRegistry`].
pub struct InMemoryWorkerRegistry {
    workers: Mutex<HashMap<String, WorkerRecord>>,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
}

impl InMemoryWorkerRegistry {
    /// Creates a registry with an injected clock.
    pub fn new(clock: Arc<dyn Clock>, lease_duration: Duration) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            clock,
            lease_duration,
        }
    }

    /// Creates a registry on the system clock.
    pub fn with_system_clock(lease_duration: Duration) -> Self {
        Self::new(Arc::new(SystemClock), lease_duration)
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn register(
        &self,
        worker_id: &str,
        capabilities: Vec<String>,
    ) -> Result<(), RegistryError> {
        let mut workers = self.workers.lock().await;
        let now = self.clock.now();
        let lease_expires_at = now + chrono_duration(self.lease_duration);

        match workers.entry(worker_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.capabilities = capabilities;
                record.lease_expires_at = lease_expires_at;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(WorkerRecord {
                    worker_id: worker_id.to_string(),
                    capabilities,
                    registered_at: now,
                    lease_expires_at,
                });
            }
        }
        Ok(())
    }

    async fn renew(&self, worker_id: &str) -> Result<(), RegistryError> {
        let mut workers = self.workers.lock().await;
        let now = self.clock.now();

        match workers.get_mut(worker_id) {
            Some(record) => {
                record.lease_expires_at = now + chrono_duration(self.lease_duration);
                Ok(())
            }
            None => Err(RegistryError::UnknownWorker(worker_id.to_string())),
        }
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), RegistryError> {
        let mut workers = self.workers.lock().await;
        workers.remove(worker_id);
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> Result<Option<WorkerRecord>, RegistryError> {
        let workers = self.workers.lock().await;
        Ok(workers.get(worker_id).cloned())
    }

    async fn remove_expired(&self) -> Result<Vec<WorkerRecord>, RegistryError> {
        let mut workers = self.workers.lock().await;
        let now = self.clock.now();

        let expired_ids: Vec<String> = workers
            .values()
            .filter(|record| record.is_expired_at(now))
            .map(|record| record.worker_id.clone())
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(record) = workers.remove(&id) {
                expired.push(record);
            }
        }
        Ok(expired)
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, RegistryError> {
        let workers = self.workers.lock().await;
        Ok(workers.values().cloned().collect())
    }
}
