//! Client Resync Manager.
//!
//! Keeps a client in step with one verification job across reloads. The job
//! handle is persisted while the job is active and cleared once a terminal
//! status is observed, so a restarted client resumes tracking instead of
//! submitting again.
//!
//! Push and poll observations of the same job are merged: the consumer never
//! sees status or progress move backwards, and a terminal status is reported
//! exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::client::storage::{HandleSlot, KeyValueStore, ResumableHandle};
use crate::client::transport::{ClientError, EventSource, JobApi};
use crate::models::event::JobEvent;
use crate::models::job::{JobSnapshot, JobStatus};
use crate::models::subject::Subject;
use crate::models::submit::SubmitResult;

pub const DEFAULT_HANDLE_KEY: &str = "verification.activeJob";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Server-sent events, falling back to polling if the subscription
    /// cannot be opened.
    Push,
    Poll,
}

#[derive(Debug, Clone)]
pub struct ResyncConfig {
    pub poll_interval: Duration,
    pub transport: TransportMode,
    /// Storage key of the resumable handle.
    pub handle_key: String,
    /// A push connection silent for this long reports [`ClientEvent::Timeout`].
    pub push_idle_timeout: Duration,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            transport: TransportMode::Push,
            handle_key: DEFAULT_HANDLE_KEY.to_string(),
            push_idle_timeout: Duration::from_secs(150),
        }
    }
}

/// What a tracker reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Progress(JobSnapshot),
    Completed(JobSnapshot),
    Failed(JobSnapshot),
    /// The push connection failed or the job disappeared.
    ConnectionError(String),
    /// The push connection went quiet. Reconnect or poll.
    Timeout,
}

/// Outcome of [`ResyncManager::initialize`].
pub enum Resume {
    /// Nothing to resume.
    Idle,
    /// The stored job had already finished; the handle was cleared.
    Finished(JobSnapshot),
    /// The stored job is still active and is being tracked again.
    Tracking(JobTracker),
}

pub struct Submission {
    pub result: SubmitResult,
    /// Present whenever the result refers to an active job.
    pub tracker: Option<JobTracker>,
}

pub struct ResyncManager {
    api: Arc<dyn JobApi>,
    push: Option<Arc<dyn EventSource>>,
    slot: HandleSlot,
    config: ResyncConfig,
}

impl ResyncManager {
    pub fn new(
        api: Arc<dyn JobApi>,
        push: Option<Arc<dyn EventSource>>,
        store: Arc<dyn KeyValueStore>,
        config: ResyncConfig,
    ) -> Self {
        let slot = HandleSlot::new(store, config.handle_key.clone());
        Self {
            api,
            push,
            slot,
            config,
        }
    }

    /// Reconcile the persisted handle with the server.
    ///
    /// Issues a single status read. A terminal or unknown job clears the
    /// handle; an active one is tracked with the configured transport. On a
    /// transport error the handle is kept for the next attempt.
    pub async fn initialize(&self) -> Result<Resume, ClientError> {
        let Some(handle) = self.slot.load().await? else {
            return Ok(Resume::Idle);
        };

        match self.api.get_status(handle.job_id).await? {
            None => {
                tracing::info!(job_id = %handle.job_id, "Stored job no longer exists");
                self.slot.clear().await?;
                Ok(Resume::Idle)
            }
            Some(snapshot) if snapshot.status.is_terminal() => {
                tracing::info!(
                    job_id = %handle.job_id,
                    status = %snapshot.status,
                    "Stored job already finished"
                );
                self.slot.clear().await?;
                Ok(Resume::Finished(snapshot))
            }
            Some(snapshot) => {
                tracing::info!(job_id = %handle.job_id, status = %snapshot.status, "Resuming job");
                let tracker = self.tracker(handle);
                tracker.shared.observe(snapshot).await;
                Ok(Resume::Tracking(self.begin(tracker).await))
            }
        }
    }

    /// Submit a subject. Queued, processing and conflicting results all
    /// refer to an active job, which is persisted and tracked.
    pub async fn submit(&self, subject: &Subject) -> Result<Submission, ClientError> {
        let result = self.api.submit(subject).await?;

        let active = match &result {
            SubmitResult::Queued { job_id, .. } | SubmitResult::Processing { job_id } => {
                Some(*job_id)
            }
            SubmitResult::Conflict { job_id, status } if status.is_active() => {
                tracing::info!(job_id = %job_id, "Resuming existing job for subject");
                Some(*job_id)
            }
            _ => None,
        };
        let Some(job_id) = active else {
            return Ok(Submission {
                result,
                tracker: None,
            });
        };

        let handle = ResumableHandle {
            job_id,
            subject_key: Some(subject.key()),
        };
        self.slot.save(&handle).await?;
        let tracker = self.begin(self.tracker(handle)).await;
        Ok(Submission {
            result,
            tracker: Some(tracker),
        })
    }

    /// Track a known job without submitting anything.
    pub async fn track(&self, job_id: Uuid) -> JobTracker {
        let handle = ResumableHandle {
            job_id,
            subject_key: None,
        };
        self.begin(self.tracker(handle)).await
    }

    fn tracker(&self, handle: ResumableHandle) -> JobTracker {
        let (tx, events) = mpsc::unbounded_channel();
        JobTracker {
            job_id: handle.job_id,
            shared: Arc::new(Shared {
                handle,
                slot: self.slot.clone(),
                state: Mutex::new(TrackState::default()),
                tx,
            }),
            events,
            api: Arc::clone(&self.api),
            push_source: self.push.clone(),
            config: self.config.clone(),
            poll: None,
            push: None,
        }
    }

    async fn begin(&self, mut tracker: JobTracker) -> JobTracker {
        if tracker.shared.is_finished().await {
            return tracker;
        }
        match self.config.transport {
            TransportMode::Push => {
                if let Err(e) = tracker.connect().await {
                    tracing::warn!(
                        job_id = %tracker.job_id,
                        error = %e,
                        "Push subscription unavailable; polling instead"
                    );
                    tracker.start_polling();
                }
            }
            TransportMode::Poll => tracker.start_polling(),
        }
        tracker
    }
}

#[derive(Default)]
struct TrackState {
    latest: Option<JobSnapshot>,
    finished: bool,
}

/// State shared between a tracker and its transport tasks.
struct Shared {
    handle: ResumableHandle,
    slot: HandleSlot,
    state: Mutex<TrackState>,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl Shared {
    /// Merge an observation. Returns `false` once tracking has ended.
    async fn observe(&self, snapshot: JobSnapshot) -> bool {
        let mut state = self.state.lock().await;
        if state.finished {
            return false;
        }

        let merged = match &state.latest {
            Some(latest) => latest.merge(snapshot),
            None => snapshot,
        };
        let changed = state.latest.as_ref() != Some(&merged);
        state.latest = Some(merged.clone());

        match merged.status {
            JobStatus::Completed | JobStatus::Failed => {
                state.finished = true;
                if let Err(e) = self.slot.clear().await {
                    tracing::warn!(job_id = %self.handle.job_id, error = %e, "Could not clear job handle");
                }
                let event = if merged.status == JobStatus::Completed {
                    ClientEvent::Completed(merged)
                } else {
                    ClientEvent::Failed(merged)
                };
                let _ = self.tx.send(event);
                false
            }
            JobStatus::Pending | JobStatus::Processing => {
                if let Err(e) = self.slot.save(&self.handle).await {
                    tracing::warn!(job_id = %self.handle.job_id, error = %e, "Could not persist job handle");
                }
                if changed {
                    let _ = self.tx.send(ClientEvent::Progress(merged));
                }
                true
            }
        }
    }

    /// The server no longer knows the job.
    async fn vanished(&self) {
        let mut state = self.state.lock().await;
        if state.finished {
            return;
        }
        state.finished = true;
        if let Err(e) = self.slot.clear().await {
            tracing::warn!(job_id = %self.handle.job_id, error = %e, "Could not clear job handle");
        }
        let _ = self.tx.send(ClientEvent::ConnectionError(format!(
            "job {} not found",
            self.handle.job_id
        )));
    }

    /// Report a transport condition unless tracking already ended.
    async fn notify(&self, event: ClientEvent) {
        let state = self.state.lock().await;
        if !state.finished {
            let _ = self.tx.send(event);
        }
    }

    async fn is_finished(&self) -> bool {
        self.state.lock().await.finished
    }
}

/// Cancellable polling task. Dropping the handle also stops it.
pub struct PollHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PollHandle {
    fn spawn(api: Arc<dyn JobApi>, shared: Arc<Shared>, period: Duration) -> Self {
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        let job_id = shared.handle.job_id;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut cancelled => break,
                    _ = ticker.tick() => {}
                }
                let status = tokio::select! {
                    _ = &mut cancelled => break,
                    status = api.get_status(job_id) => status,
                };
                match status {
                    Ok(Some(snapshot)) => {
                        if !shared.observe(snapshot).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        shared.vanished().await;
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        tracing::debug!(job_id = %job_id, error = %e, "Status poll failed; retrying");
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Status poll failed; retrying");
                    }
                }
            }
            tracing::debug!(job_id = %job_id, "Polling stopped");
        });

        Self {
            cancel: Some(cancel),
            task,
        }
    }

    /// Stop polling. Server-side work is unaffected.
    pub fn cancel(mut self) {
        self.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// An open push subscription. Never reconnects on its own.
pub struct PushConnection {
    task: JoinHandle<()>,
}

impl PushConnection {
    async fn open(
        source: &dyn EventSource,
        shared: Arc<Shared>,
        idle_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let job_id = shared.handle.job_id;
        let mut stream = source.subscribe(job_id).await?;

        let task = tokio::spawn(async move {
            loop {
                let event = match tokio::time::timeout(idle_timeout, stream.recv()).await {
                    Err(_) => {
                        shared.notify(ClientEvent::Timeout).await;
                        break;
                    }
                    Ok(None) => {
                        shared
                            .notify(ClientEvent::ConnectionError(
                                "push stream ended unexpectedly".to_string(),
                            ))
                            .await;
                        break;
                    }
                    Ok(Some(event)) => event,
                };
                match event {
                    JobEvent::Progress(snapshot) => {
                        if !shared.observe(snapshot).await {
                            break;
                        }
                    }
                    JobEvent::Completed(snapshot) | JobEvent::Failed(snapshot) => {
                        shared.observe(snapshot).await;
                        break;
                    }
                    JobEvent::Timeout { .. } => {
                        shared.notify(ClientEvent::Timeout).await;
                        break;
                    }
                    JobEvent::Error { message } => {
                        shared.notify(ClientEvent::ConnectionError(message)).await;
                        break;
                    }
                }
            }
            tracing::debug!(job_id = %job_id, "Push connection closed");
        });

        Ok(Self { task })
    }

    pub fn is_open(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for PushConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Tracks one job and yields [`ClientEvent`]s for it.
///
/// Stopping or dropping a tracker ends client-side tracking only. The
/// persisted handle stays until a terminal status is observed.
pub struct JobTracker {
    job_id: Uuid,
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    api: Arc<dyn JobApi>,
    push_source: Option<Arc<dyn EventSource>>,
    config: ResyncConfig,
    poll: Option<PollHandle>,
    push: Option<PushConnection>,
}

impl JobTracker {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next event. `None` after the terminal event has been delivered.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        let finished = self.shared.is_finished().await;
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(_) if finished => None,
            Err(_) => self.events.recv().await,
        }
    }

    /// Most advanced state observed so far.
    pub async fn latest(&self) -> Option<JobSnapshot> {
        self.shared.state.lock().await.latest.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.poll.as_ref().is_some_and(|poll| !poll.is_finished())
    }

    pub fn is_connected(&self) -> bool {
        self.push.as_ref().is_some_and(PushConnection::is_open)
    }

    /// Start polling at the configured interval. Replaces any running poller.
    pub fn start_polling(&mut self) {
        self.stop_polling();
        self.poll = Some(PollHandle::spawn(
            Arc::clone(&self.api),
            Arc::clone(&self.shared),
            self.config.poll_interval,
        ));
    }

    pub fn stop_polling(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.cancel();
        }
    }

    /// Open a push subscription, closing any previous one.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let source = self
            .push_source
            .clone()
            .ok_or(ClientError::NoPushTransport)?;
        self.disconnect();
        let connection = PushConnection::open(
            source.as_ref(),
            Arc::clone(&self.shared),
            self.config.push_idle_timeout,
        )
        .await?;
        self.push = Some(connection);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(connection) = self.push.take() {
            connection.close();
        }
    }

    /// Stop every transport.
    pub fn stop(mut self) {
        self.stop_polling();
        self.disconnect();
    }
}
