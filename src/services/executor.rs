use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::event::JobEvent;
use crate::models::job::{JobStatus, Transition, VerificationJob};
use crate::services::broadcaster::ProgressBroadcaster;
use crate::services::dedup::SubjectLocks;
use crate::services::queue::{Admission, JobQueue, QueuePosition};
use crate::services::store::{JobStore, StoreError, WorkerLease};
use crate::services::verifier::{
    ProgressReporter, ProgressUpdate, VerificationOutcome, Verifier, VerifierError,
};

const INTERRUPTED_MESSAGE: &str = "verification interrupted by service restart";

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("another verification worker already owns this job store")]
    WorkerActive,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What startup recovery found in the job store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    pub requeued: usize,
    pub interrupted: usize,
}

/// The single verification worker.
///
/// Claims one job at a time from the queue, drives the verifier, and records
/// every state change in the store before broadcasting it. Runs regardless
/// of whether any client is watching.
///
/// Recovery and the worker loop only run while this executor holds the
/// store's worker lease, so at most one worker drives a given store.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    locks: Arc<SubjectLocks>,
    broadcaster: Arc<ProgressBroadcaster>,
    verifier: Arc<dyn Verifier>,
    job_timeout: Duration,
    lease: Mutex<Option<WorkerLease>>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<JobQueue>,
        locks: Arc<SubjectLocks>,
        broadcaster: Arc<ProgressBroadcaster>,
        verifier: Arc<dyn Verifier>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            broadcaster,
            verifier,
            job_timeout,
            lease: Mutex::new(None),
        }
    }

    /// Take the store's worker lease. Idempotent once held.
    pub async fn claim(&self) -> Result<(), ExecutorError> {
        let mut lease = self.lease.lock().await;
        if lease.is_none() {
            let acquired = self
                .store
                .try_acquire_worker_lease()
                .await?
                .ok_or(ExecutorError::WorkerActive)?;
            tracing::info!(backend = self.store.backend(), "Worker lease acquired");
            *lease = Some(acquired);
        }
        Ok(())
    }

    /// Run the worker loop on a background task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(&self) {
        if let Err(e) = self.claim().await {
            tracing::error!(error = %e, "Verification worker not started");
            return;
        }
        tracing::info!("Verification worker ready");
        loop {
            let dequeued = self.queue.next().await;
            self.publish_positions(dequeued.positions).await;
            self.process(dequeued.job_id).await;
        }
    }

    /// Restore in-flight state left behind by a previous process.
    ///
    /// Jobs that were mid-run cannot be resumed (the external session is
    /// gone) and are failed; pending jobs are re-queued in creation order.
    /// Must run before the worker loop starts. Fails with
    /// [`ExecutorError::WorkerActive`] without touching any job when another
    /// worker holds the lease.
    pub async fn recover(&self) -> Result<RecoverySummary, ExecutorError> {
        self.claim().await?;

        let mut summary = RecoverySummary::default();
        for job in self.store.list_active().await? {
            match job.status {
                JobStatus::Processing => {
                    let failed = self
                        .store
                        .apply(
                            job.id,
                            Transition::Fail {
                                message: INTERRUPTED_MESSAGE.to_string(),
                            },
                        )
                        .await?;
                    tracing::warn!(
                        job_id = %failed.id,
                        subject_key = %failed.subject_key,
                        "Failed job interrupted by restart"
                    );
                    summary.interrupted += 1;
                }
                JobStatus::Pending => {
                    if let Err(holder) = self.locks.try_acquire(&job.subject_key, job.id) {
                        tracing::error!(
                            job_id = %job.id,
                            holder = %holder,
                            "Duplicate active job found during recovery"
                        );
                        continue;
                    }
                    self.broadcaster.open(job.id);
                    if let Admission::Queued { position } = self.queue.enqueue(job.id).await {
                        self.store
                            .apply(job.id, Transition::Reposition { position })
                            .await?;
                    }
                    summary.requeued += 1;
                }
                JobStatus::Completed | JobStatus::Failed => {}
            }
        }
        tracing::info!(
            requeued = summary.requeued,
            interrupted = summary.interrupted,
            "Job recovery complete"
        );
        Ok(summary)
    }

    /// Drive one job from `Pending` to a terminal status.
    pub async fn process(&self, job_id: Uuid) {
        let started = Instant::now();

        let job = match self.store.apply(job_id, Transition::Start).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not start job");
                self.abandon(job_id).await;
                return;
            }
        };

        tracing::info!(
            job_id = %job.id,
            subject_key = %job.subject_key,
            "Processing verification job"
        );
        self.broadcaster
            .publish(job.id, JobEvent::from_snapshot(job.snapshot()));

        let outcome = self.run_verifier(&job).await;

        let transition = match outcome {
            Ok(outcome) => Transition::Complete {
                carriers: outcome.carriers,
                files: outcome.files,
            },
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Verification failed");
                Transition::Fail {
                    message: e.to_string(),
                }
            }
        };

        let finished = match self.store.apply(job.id, transition.clone()).await {
            Ok(finished) => finished,
            Err(e) => {
                // Still release the worker and tell subscribers how it ended.
                tracing::error!(job_id = %job.id, error = %e, "Failed to record job outcome");
                let mut fallback = job.clone();
                let _ = fallback.apply(transition);
                fallback
            }
        };

        let elapsed = started.elapsed();
        metrics::histogram!("verification_processing_seconds").record(elapsed.as_secs_f64());
        match finished.status {
            JobStatus::Completed => {
                metrics::counter!("verification_jobs_completed").increment(1);
                tracing::info!(
                    job_id = %finished.id,
                    carriers = finished.result_carriers.len(),
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
            }
            _ => {
                metrics::counter!("verification_jobs_failed").increment(1);
                tracing::info!(
                    job_id = %finished.id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job failed"
                );
            }
        }

        self.settle(&finished).await;
    }

    async fn run_verifier(
        &self,
        job: &VerificationJob,
    ) -> Result<VerificationOutcome, VerifierError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let reporter = ProgressReporter::new(tx);

        let finished = Notify::new();

        let run = async {
            let outcome =
                tokio::time::timeout(self.job_timeout, self.verifier.execute(&job.subject, reporter))
                    .await
                    .unwrap_or(Err(VerifierError::Timeout(self.job_timeout)));
            finished.notify_one();
            outcome
        };
        // Stops with the run even if a reporter clone outlives it, after
        // draining whatever was already sent.
        let relay = async {
            loop {
                tokio::select! {
                    update = rx.recv() => match update {
                        Some(update) => self.record_progress(job.id, update).await,
                        None => break,
                    },
                    _ = finished.notified() => break,
                }
            }
            rx.close();
            while let Ok(update) = rx.try_recv() {
                self.record_progress(job.id, update).await;
            }
        };

        let (outcome, ()) = tokio::join!(run, relay);
        outcome
    }

    async fn record_progress(&self, job_id: Uuid, update: ProgressUpdate) {
        let transition = Transition::Progress {
            percent: update.percent,
            message: update.message,
        };
        match self.store.apply(job_id, transition).await {
            Ok(job) => {
                tracing::debug!(job_id = %job_id, progress = job.progress, "Progress recorded");
                self.broadcaster
                    .publish(job_id, JobEvent::from_snapshot(job.snapshot()));
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Dropped progress update");
            }
        }
    }

    /// Terminal bookkeeping: broadcast and close, unlock the subject, free
    /// the worker slot.
    async fn settle(&self, finished: &VerificationJob) {
        self.broadcaster
            .finish(finished.id, JobEvent::from_snapshot(finished.snapshot()));
        self.locks.release(&finished.subject_key, finished.id);
        let positions = self.queue.complete(finished.id).await;
        self.publish_positions(positions).await;
    }

    /// Free the worker slot after a job could not be started.
    ///
    /// A job that is already terminal is settled normally. One still marked
    /// active keeps its subject lock and is picked up again by the next
    /// startup recovery.
    async fn abandon(&self, job_id: Uuid) {
        match self.store.get(job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => {
                self.settle(&job).await;
                return;
            }
            Ok(Some(job)) => {
                tracing::error!(
                    job_id = %job_id,
                    status = %job.status,
                    "Job left active until next recovery"
                );
            }
            Ok(None) => {
                self.broadcaster.finish(
                    job_id,
                    JobEvent::Error {
                        message: format!("job {job_id} not found"),
                    },
                );
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not load abandoned job");
            }
        }
        let positions = self.queue.complete(job_id).await;
        self.publish_positions(positions).await;
    }

    /// Write new queue positions and notify subscribers of jobs that moved.
    async fn publish_positions(&self, positions: Vec<QueuePosition>) {
        for QueuePosition { job_id, position } in positions {
            let current = match self.store.get(job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not read queued job");
                    continue;
                }
            };
            if current.status != JobStatus::Pending || current.queue_position == position {
                continue;
            }
            match self
                .store
                .apply(job_id, Transition::Reposition { position })
                .await
            {
                Ok(job) => {
                    if self.broadcaster.has_subscribers(job_id) {
                        self.broadcaster
                            .publish(job_id, JobEvent::from_snapshot(job.snapshot()));
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not update queue position");
                }
            }
        }
    }
}
