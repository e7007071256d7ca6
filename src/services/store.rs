//! Durable record of every verification job.
//!
//! [`JobStore`] is the single source of truth for job state. The Postgres
//! implementation lives in [`crate::db::queries`]; [`MemoryJobStore`] backs
//! deployments without a database and the test suite.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::job::{Transition, TransitionError, VerificationJob};
use crate::services::encryption::EncryptionError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("subject {0} already has an active job")]
    ActiveJobExists(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Subject payload error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Stored job is corrupt: {0}")]
    Corrupt(String),
}

/// Exclusive right to run the verification worker over a store's jobs.
///
/// Held for as long as the worker runs; dropping it releases the claim.
pub struct WorkerLease {
    _guard: Box<dyn Send>,
}

impl WorkerLease {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Fails with [`StoreError::ActiveJobExists`] if the
    /// subject already has a pending or processing job.
    async fn insert(&self, job: &VerificationJob) -> Result<(), StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError>;

    /// Apply a transition atomically and return the updated job.
    async fn apply(&self, job_id: Uuid, transition: Transition)
        -> Result<VerificationJob, StoreError>;

    /// The subject's pending or processing job, if any.
    async fn find_active(&self, subject_key: &str) -> Result<Option<VerificationJob>, StoreError>;

    /// All pending and processing jobs, oldest first.
    async fn list_active(&self) -> Result<Vec<VerificationJob>, StoreError>;

    /// Claim the worker lease. `None` while another worker holds it.
    async fn try_acquire_worker_lease(&self) -> Result<Option<WorkerLease>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;

    /// Short backend name for health reporting.
    fn backend(&self) -> &'static str;
}

/// In-process job store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, VerificationJob>>,
    worker: Arc<Mutex<()>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &VerificationJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let duplicate = jobs
            .values()
            .any(|j| j.subject_key == job.subject_key && j.status.is_active());
        if duplicate {
            return Err(StoreError::ActiveJobExists(job.subject_key.clone()));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn apply(
        &self,
        job_id: Uuid,
        transition: Transition,
    ) -> Result<VerificationJob, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        job.apply(transition)?;
        Ok(job.clone())
    }

    async fn find_active(&self, subject_key: &str) -> Result<Option<VerificationJob>, StoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|j| j.subject_key == subject_key && j.status.is_active())
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<VerificationJob>, StoreError> {
        let mut active: Vec<_> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.status.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|j| j.created_at);
        Ok(active)
    }

    async fn try_acquire_worker_lease(&self) -> Result<Option<WorkerLease>, StoreError> {
        Ok(Arc::clone(&self.worker).try_lock_owned().ok().map(WorkerLease::new))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
