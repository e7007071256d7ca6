use std::collections::VecDeque;
use std::time::Duration;

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::models::event::JobEvent;
use crate::models::job::{JobSnapshot, JobStatus};
use crate::services::broadcaster::ProgressBroadcaster;
use crate::services::store::{JobStore, StoreError};

/// One subscriber's view of a job's events.
///
/// Starts with the job's current state, then relays broadcast events. Events
/// that would move status or progress backwards are dropped. After the final
/// event (`completed`, `failed`, `timeout` or `error`) the stream ends.
pub struct JobEventStream {
    job_id: Uuid,
    queued: VecDeque<JobEvent>,
    rx: Option<broadcast::Receiver<JobEvent>>,
    last: Option<(JobStatus, u8)>,
    idle_timeout: Duration,
    done: bool,
}

impl JobEventStream {
    /// Subscribe before reading the store so that no transition between the
    /// two is missed.
    pub async fn open(
        store: &dyn JobStore,
        broadcaster: &ProgressBroadcaster,
        job_id: Uuid,
        idle_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let rx = broadcaster.subscribe(job_id);
        let mut queued = VecDeque::new();

        let rx = match store.get(job_id).await? {
            None => {
                queued.push_back(JobEvent::Error {
                    message: format!("job {job_id} not found"),
                });
                None
            }
            Some(job) => {
                let event = JobEvent::from_snapshot(job.snapshot());
                let final_event = event.is_final();
                queued.push_back(event);
                if final_event {
                    None
                } else {
                    if rx.is_none() {
                        queued.push_back(JobEvent::Error {
                            message: format!("job {job_id} is not accepting subscriptions"),
                        });
                    }
                    rx
                }
            }
        };

        Ok(Self {
            job_id,
            queued,
            rx,
            last: None,
            idle_timeout,
            done: false,
        })
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next event, or `None` after the final event has been delivered.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        if self.done {
            return None;
        }

        while let Some(event) = self.queued.pop_front() {
            if let Some(event) = self.admit(event) {
                return Some(event);
            }
        }

        loop {
            let Some(rx) = self.rx.as_mut() else {
                self.done = true;
                return None;
            };
            match tokio::time::timeout(self.idle_timeout, rx.recv()).await {
                Err(_) => {
                    return self.admit(JobEvent::Timeout {
                        message: format!(
                            "no activity for {} seconds",
                            self.idle_timeout.as_secs()
                        ),
                    });
                }
                Ok(Ok(event)) => {
                    if let Some(event) = self.admit(event) {
                        return Some(event);
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::debug!(job_id = %self.job_id, skipped, "Subscriber lagged");
                }
                Ok(Err(RecvError::Closed)) => {
                    return self.admit(JobEvent::Error {
                        message: "event channel closed before the job finished".to_string(),
                    });
                }
            }
        }
    }

    fn admit(&mut self, event: JobEvent) -> Option<JobEvent> {
        if let Some(snapshot) = event.snapshot() {
            if self.regresses(snapshot) {
                return None;
            }
            self.last = Some((snapshot.status, snapshot.progress));
        }
        if event.is_final() {
            self.done = true;
            self.rx = None;
            self.queued.clear();
        }
        Some(event)
    }

    fn regresses(&self, snapshot: &JobSnapshot) -> bool {
        match self.last {
            Some((status, progress)) => {
                status.is_ahead_of(snapshot.status)
                    || (status == snapshot.status && snapshot.progress < progress)
            }
            None => false,
        }
    }

    /// Adapt into a `Stream` for response bodies.
    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next_event().await.map(|event| (event, stream))
        })
    }
}
