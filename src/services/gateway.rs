use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::models::job::{JobSnapshot, JobStatus, Transition, VerificationJob};
use crate::models::subject::{FieldError, Subject};
use crate::models::submit::SubmitResult;
use crate::services::broadcaster::ProgressBroadcaster;
use crate::services::dedup::SubjectLocks;
use crate::services::queue::{Admission, JobQueue};
use crate::services::rate_limit::{RateDecision, RateLimiter};
use crate::services::store::{JobStore, StoreError};
use crate::services::subscription::JobEventStream;
use crate::services::verifier::{Verifier, VerifierError};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("submission has {} invalid field(s)", .0.len())]
    Validation(Vec<FieldError>),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Verifier(#[from] VerifierError),
}

/// Entry point for submissions and status reads.
pub struct Gateway {
    store: Arc<dyn JobStore>,
    locks: Arc<SubjectLocks>,
    queue: Arc<JobQueue>,
    limiter: Arc<dyn RateLimiter>,
    broadcaster: Arc<ProgressBroadcaster>,
    verifier: Arc<dyn Verifier>,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<SubjectLocks>,
        queue: Arc<JobQueue>,
        limiter: Arc<dyn RateLimiter>,
        broadcaster: Arc<ProgressBroadcaster>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            store,
            locks,
            queue,
            limiter,
            broadcaster,
            verifier,
        }
    }

    /// Validate, rate-limit and enqueue a verification request.
    ///
    /// A subject with an active job gets that job back as a conflict; no
    /// second job is ever created for it.
    pub async fn submit(&self, subject: Subject) -> Result<SubmitResult, GatewayError> {
        subject.check().map_err(GatewayError::Validation)?;
        let subject_key = subject.key();

        if let Some(limited) = self.rate_limit(&subject_key).await {
            return Ok(limited);
        }

        let job = VerificationJob::new(subject);
        while let Err(holder) = self.locks.try_acquire(&subject_key, job.id) {
            if !self.release_if_finished(&subject_key, holder).await? {
                return self.conflict(&subject_key, Some(holder)).await;
            }
        }

        match self.store.insert(&job).await {
            Ok(()) => {}
            Err(StoreError::ActiveJobExists(_)) => {
                // The store already holds an active job the lock index never saw.
                self.locks.release(&subject_key, job.id);
                return self.conflict(&subject_key, None).await;
            }
            Err(e) => {
                self.locks.release(&subject_key, job.id);
                return Err(e.into());
            }
        }

        metrics::counter!("verification_jobs_total").increment(1);
        self.broadcaster.open(job.id);

        let result = match self.queue.enqueue(job.id).await {
            Admission::Dispatched => SubmitResult::Processing { job_id: job.id },
            Admission::Queued { position } => SubmitResult::Queued {
                job_id: job.id,
                position: self.record_position(job.id, position).await,
            },
        };

        tracing::info!(
            job_id = %job.id,
            subject_key = %subject_key,
            result = ?result,
            "Verification submitted"
        );
        Ok(result)
    }

    /// Synchronous document analysis. Validated and rate-limited like
    /// [`Gateway::submit`], but never queued.
    pub async fn analyze(
        &self,
        subject: Subject,
        document: &[u8],
    ) -> Result<SubmitResult, GatewayError> {
        subject.check().map_err(GatewayError::Validation)?;
        let subject_key = subject.key();

        if let Some(limited) = self.rate_limit(&subject_key).await {
            return Ok(limited);
        }

        let analysis = self.verifier.analyze_document(&subject, document).await?;
        tracing::info!(subject_key = %subject_key, "Document analysis completed");
        Ok(SubmitResult::Immediate { analysis })
    }

    /// Current state of a job. Pure read.
    pub async fn get_status(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, GatewayError> {
        Ok(self.store.get(job_id).await?.map(|job| job.snapshot()))
    }

    /// Open a push subscription for a job.
    pub async fn subscribe(
        &self,
        job_id: Uuid,
        idle_timeout: Duration,
    ) -> Result<JobEventStream, GatewayError> {
        Ok(JobEventStream::open(self.store.as_ref(), &self.broadcaster, job_id, idle_timeout).await?)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    async fn rate_limit(&self, subject_key: &str) -> Option<SubmitResult> {
        match self.limiter.check(subject_key).await {
            Ok(RateDecision::Allowed) => None,
            Ok(decision) => {
                let retry_after_seconds = decision.retry_after_seconds().unwrap_or(1);
                metrics::counter!("verification_submissions_rate_limited").increment(1);
                tracing::info!(
                    subject_key = %subject_key,
                    retry_after_seconds,
                    "Submission rate limited"
                );
                Some(SubmitResult::RateLimited {
                    retry_after_seconds,
                })
            }
            Err(e) => {
                // Fail open: a limiter outage must not block verifications.
                tracing::warn!(subject_key = %subject_key, error = %e, "Rate limiter unavailable");
                None
            }
        }
    }

    /// Store a new job's admission position and return the value that stuck.
    ///
    /// The worker may recompute positions between `enqueue` and the write,
    /// so the queue is re-read after every write until the two agree.
    async fn record_position(&self, job_id: Uuid, mut position: u32) -> u32 {
        // New jobs are inserted at position 0.
        let mut stored = 0;
        loop {
            if position != stored {
                if let Err(e) = self
                    .store
                    .apply(job_id, Transition::Reposition { position })
                    .await
                {
                    // The worker may already have claimed it.
                    tracing::debug!(job_id = %job_id, error = %e, "Initial position not recorded");
                    return position;
                }
                stored = position;
            }
            match self.queue.position_of(job_id).await {
                Some(current) if current != stored => position = current,
                _ => return stored,
            }
        }
    }

    /// Drop a subject claim whose job already reached a terminal status.
    ///
    /// The executor records the outcome before it releases the claim; a
    /// submission landing in between must not see a conflict.
    async fn release_if_finished(
        &self,
        subject_key: &str,
        holder: Uuid,
    ) -> Result<bool, GatewayError> {
        match self.store.get(holder).await? {
            Some(job) if job.status.is_terminal() => {
                self.locks.release(subject_key, holder);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn conflict(
        &self,
        subject_key: &str,
        holder: Option<Uuid>,
    ) -> Result<SubmitResult, GatewayError> {
        metrics::counter!("verification_submissions_conflicted").increment(1);

        let existing = match holder {
            Some(job_id) => self.store.get(job_id).await?,
            None => None,
        };
        let existing = match existing {
            Some(job) => Some(job),
            None => self.store.find_active(subject_key).await?,
        };

        let (job_id, status) = match (existing, holder) {
            (Some(job), _) => (job.id, job.status),
            // Lock claimed but the record is still being written.
            (None, Some(job_id)) => (job_id, JobStatus::Pending),
            (None, None) => return Err(StoreError::ActiveJobExists(subject_key.to_string()).into()),
        };

        tracing::info!(
            job_id = %job_id,
            subject_key = %subject_key,
            status = %status,
            "Submission conflicts with active job"
        );
        Ok(SubmitResult::Conflict { job_id, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::models::subject::tests::sample_subject;
    use crate::services::executor::JobExecutor;
    use crate::services::rate_limit::{RateLimitPolicy, SlidingWindowLimiter};
    use crate::services::store::{MemoryJobStore, WorkerLease};
    use crate::services::verifier::{ProgressReporter, VerificationOutcome};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    struct NeverCalled;

    #[async_trait]
    impl Verifier for NeverCalled {
        async fn execute(
            &self,
            _subject: &Subject,
            _progress: ProgressReporter,
        ) -> Result<VerificationOutcome, VerifierError> {
            Err(VerifierError::Site("not expected".into()))
        }
    }

    struct Succeeds;

    #[async_trait]
    impl Verifier for Succeeds {
        async fn execute(
            &self,
            _subject: &Subject,
            _progress: ProgressReporter,
        ) -> Result<VerificationOutcome, VerifierError> {
            Ok(VerificationOutcome {
                carriers: vec!["Aetna".into()],
                files: vec![],
            })
        }
    }

    /// Memory store that can hold one `Reposition` write until resumed.
    #[derive(Default)]
    struct PausingStore {
        inner: MemoryJobStore,
        armed: AtomicBool,
        entered: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl JobStore for PausingStore {
        async fn insert(&self, job: &VerificationJob) -> Result<(), StoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError> {
            self.inner.get(job_id).await
        }

        async fn apply(
            &self,
            job_id: Uuid,
            transition: Transition,
        ) -> Result<VerificationJob, StoreError> {
            if matches!(transition, Transition::Reposition { .. })
                && self.armed.swap(false, Ordering::SeqCst)
            {
                self.entered.notify_one();
                self.resume.notified().await;
            }
            self.inner.apply(job_id, transition).await
        }

        async fn find_active(
            &self,
            subject_key: &str,
        ) -> Result<Option<VerificationJob>, StoreError> {
            self.inner.find_active(subject_key).await
        }

        async fn list_active(&self) -> Result<Vec<VerificationJob>, StoreError> {
            self.inner.list_active().await
        }

        async fn try_acquire_worker_lease(&self) -> Result<Option<WorkerLease>, StoreError> {
            self.inner.try_acquire_worker_lease().await
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            Ok(())
        }

        fn backend(&self) -> &'static str {
            "memory"
        }
    }

    struct Wired {
        gateway: Arc<Gateway>,
        queue: Arc<JobQueue>,
        locks: Arc<SubjectLocks>,
        broadcaster: Arc<ProgressBroadcaster>,
    }

    fn wire(store: Arc<dyn JobStore>) -> Wired {
        let queue = Arc::new(JobQueue::new());
        let locks = Arc::new(SubjectLocks::new());
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let gateway = Arc::new(Gateway::new(
            store,
            Arc::clone(&locks),
            Arc::clone(&queue),
            Arc::new(SlidingWindowLimiter::new(RateLimitPolicy {
                max_submissions: 100,
                window: Duration::from_secs(3600),
            })),
            Arc::clone(&broadcaster),
            Arc::new(NeverCalled),
        ));
        Wired {
            gateway,
            queue,
            locks,
            broadcaster,
        }
    }

    fn subject_with_npn(npn: &str) -> Subject {
        Subject {
            npn: npn.to_string(),
            ..sample_subject()
        }
    }

    fn gateway(max_submissions: u32) -> (Gateway, Arc<JobQueue>) {
        let queue = Arc::new(JobQueue::new());
        let gateway = Gateway::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(SubjectLocks::new()),
            Arc::clone(&queue),
            Arc::new(SlidingWindowLimiter::new(RateLimitPolicy {
                max_submissions,
                window: Duration::from_secs(3600),
            })),
            Arc::new(ProgressBroadcaster::new()),
            Arc::new(NeverCalled),
        );
        (gateway, queue)
    }

    #[tokio::test]
    async fn test_duplicate_submission_returns_same_job() {
        let (gateway, _queue) = gateway(5);
        let first = gateway.submit(sample_subject()).await.unwrap();
        let SubmitResult::Queued { job_id, position } = first else {
            panic!("expected queued, got {first:?}");
        };
        assert_eq!(position, 0);

        let second = gateway.submit(sample_subject()).await.unwrap();
        assert_eq!(
            second,
            SubmitResult::Conflict {
                job_id,
                status: JobStatus::Pending
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_subject_creates_nothing() {
        let (gateway, queue) = gateway(5);
        let mut subject = sample_subject();
        subject.npn = "abc".into();
        subject.resident_state = String::new();
        let err = gateway.submit(subject).await.unwrap_err();
        let GatewayError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_counts_conflicting_attempts() {
        let (gateway, _queue) = gateway(5);
        for _ in 0..5 {
            let result = gateway.submit(sample_subject()).await.unwrap();
            assert!(!matches!(result, SubmitResult::RateLimited { .. }));
        }
        let sixth = gateway.submit(sample_subject()).await.unwrap();
        assert_eq!(
            sixth,
            SubmitResult::RateLimited {
                retry_after_seconds: 3600
            }
        );
    }

    #[tokio::test]
    async fn test_positions_grow_for_distinct_subjects() {
        let (gateway, _queue) = gateway(5);
        for expected in 0..3u32 {
            let mut subject = sample_subject();
            subject.npn = format!("90{expected}");
            let result = gateway.submit(subject).await.unwrap();
            let SubmitResult::Queued { job_id, position } = result else {
                panic!("expected queued");
            };
            assert_eq!(position, expected);
            let snapshot = gateway.get_status(job_id).await.unwrap().unwrap();
            assert_eq!(snapshot.position, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_status_of_unknown_job() {
        let (gateway, _queue) = gateway(5);
        assert!(gateway.get_status(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_analyze_unsupported_verifier() {
        let (gateway, _queue) = gateway(5);
        let err = gateway.analyze(sample_subject(), b"%PDF").await.unwrap_err();
        assert!(matches!(err, GatewayError::Verifier(VerifierError::Unsupported)));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_create_one_job() {
        let store = Arc::new(MemoryJobStore::new());
        let wired = wire(store.clone());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gateway = Arc::clone(&wired.gateway);
            handles.push(tokio::spawn(async move {
                gateway.submit(sample_subject()).await.unwrap()
            }));
        }
        let mut accepted = Vec::new();
        let mut conflicts = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                SubmitResult::Queued { job_id, .. } | SubmitResult::Processing { job_id } => {
                    accepted.push(job_id)
                }
                SubmitResult::Conflict { job_id, status } => {
                    assert_eq!(status, JobStatus::Pending);
                    conflicts.push(job_id);
                }
                other => panic!("unexpected result {other:?}"),
            }
        }

        assert_eq!(accepted.len(), 1);
        assert_eq!(conflicts.len(), 15);
        assert!(conflicts.iter().all(|id| *id == accepted[0]));

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, accepted[0]);
        assert_eq!(wired.queue.depth().await, 1);
    }

    #[tokio::test]
    async fn test_finished_holder_does_not_conflict() {
        let store = Arc::new(MemoryJobStore::new());
        let wired = wire(store.clone());

        // Outcome recorded, claim not yet released by the worker.
        let finished = VerificationJob::new(sample_subject());
        wired.locks.try_acquire(&finished.subject_key, finished.id).unwrap();
        store.insert(&finished).await.unwrap();
        store.apply(finished.id, Transition::Start).await.unwrap();
        store
            .apply(
                finished.id,
                Transition::Complete {
                    carriers: vec!["Aetna".into()],
                    files: vec![],
                },
            )
            .await
            .unwrap();

        let result = wired.gateway.submit(sample_subject()).await.unwrap();
        let SubmitResult::Queued { job_id, position } = result else {
            panic!("expected a new queued job, got {result:?}");
        };
        assert_ne!(job_id, finished.id);
        assert_eq!(position, 0);
        assert_eq!(wired.locks.holder(&finished.subject_key), Some(job_id));
    }

    #[tokio::test]
    async fn test_position_written_after_queue_advanced_is_corrected() {
        let store = Arc::new(PausingStore::default());
        let wired = wire(store.clone());
        let executor = JobExecutor::new(
            store.clone(),
            Arc::clone(&wired.queue),
            Arc::clone(&wired.locks),
            Arc::clone(&wired.broadcaster),
            Arc::new(Succeeds),
            Duration::from_secs(5),
        );

        wired.gateway.submit(subject_with_npn("701")).await.unwrap();
        let running = wired.queue.next().await;
        let second = wired.gateway.submit(subject_with_npn("702")).await.unwrap();
        assert!(matches!(second, SubmitResult::Queued { position: 1, .. }));

        // Hold the third job's first position write until the running job
        // has finished and the worker has recomputed positions.
        store.armed.store(true, Ordering::SeqCst);
        let third = {
            let gateway = Arc::clone(&wired.gateway);
            tokio::spawn(async move { gateway.submit(subject_with_npn("703")).await })
        };
        store.entered.notified().await;
        executor.process(running.job_id).await;
        store.resume.notify_one();

        let result = third.await.unwrap().unwrap();
        let job_id = result.job_id().expect("accepted");
        assert_eq!(result, SubmitResult::Queued { job_id, position: 1 });
        assert_eq!(wired.queue.position_of(job_id).await, Some(1));
        let snapshot = wired.gateway.get_status(job_id).await.unwrap().unwrap();
        assert_eq!(snapshot.position, Some(1));
    }
}
