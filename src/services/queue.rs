use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// How the queue accepted a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Handed directly to the idle worker.
    Dispatched,
    /// Waiting behind `position` jobs.
    Queued { position: u32 },
}

/// A job's place in line after the queue changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePosition {
    pub job_id: Uuid,
    pub position: u32,
}

/// A job released to the worker, plus the recomputed positions of everything
/// still waiting.
#[derive(Debug)]
pub struct Dequeued {
    pub job_id: Uuid,
    pub positions: Vec<QueuePosition>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    in_flight: Option<Uuid>,
    /// Job assigned by `enqueue` to a worker parked in `next`.
    handoff: Option<Uuid>,
    worker_waiting: bool,
}

impl QueueState {
    fn positions(&self) -> Vec<QueuePosition> {
        let ahead = u32::from(self.in_flight.is_some());
        self.pending
            .iter()
            .zip(0u32..)
            .map(|(job_id, index)| QueuePosition {
                job_id: *job_id,
                position: ahead + index,
            })
            .collect()
    }
}

/// FIFO queue feeding the single verification worker.
///
/// At most one job is in flight at a time. A job's position is the number of
/// jobs ahead of it that are still pending or processing.
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job to the back of the queue.
    pub async fn enqueue(&self, job_id: Uuid) -> Admission {
        let mut state = self.state.lock().await;
        if state.worker_waiting && state.in_flight.is_none() && state.pending.is_empty() {
            state.in_flight = Some(job_id);
            state.handoff = Some(job_id);
            state.worker_waiting = false;
            drop(state);
            self.notify.notify_one();
            return Admission::Dispatched;
        }

        let position = u32::from(state.in_flight.is_some())
            .saturating_add(u32::try_from(state.pending.len()).unwrap_or(u32::MAX));
        state.pending.push_back(job_id);
        metrics::gauge!("verification_queue_depth").set(state.pending.len() as f64);
        drop(state);
        self.notify.notify_one();
        Admission::Queued { position }
    }

    /// Wait until the worker slot is free and a job is available, then claim
    /// it.
    pub async fn next(&self) -> Dequeued {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(job_id) = state.handoff.take() {
                    state.worker_waiting = false;
                    return Dequeued {
                        job_id,
                        positions: Vec::new(),
                    };
                }
                if state.in_flight.is_none() {
                    if let Some(job_id) = state.pending.pop_front() {
                        state.in_flight = Some(job_id);
                        state.worker_waiting = false;
                        metrics::gauge!("verification_queue_depth")
                            .set(state.pending.len() as f64);
                        return Dequeued {
                            job_id,
                            positions: state.positions(),
                        };
                    }
                }
                state.worker_waiting = true;
            }
            self.notify.notified().await;
        }
    }

    /// Free the worker slot held by `job_id` and return the recomputed
    /// positions of the remaining jobs.
    pub async fn complete(&self, job_id: Uuid) -> Vec<QueuePosition> {
        let mut state = self.state.lock().await;
        if state.in_flight == Some(job_id) {
            state.in_flight = None;
        } else {
            tracing::warn!(job_id = %job_id, "Completed job was not in flight");
        }
        let positions = state.positions();
        drop(state);
        self.notify.notify_one();
        positions
    }

    pub async fn position_of(&self, job_id: Uuid) -> Option<u32> {
        self.state
            .lock()
            .await
            .positions()
            .into_iter()
            .find(|p| p.job_id == job_id)
            .map(|p| p.position)
    }

    pub async fn in_flight(&self) -> Option<Uuid> {
        self.state.lock().await.in_flight
    }

    /// Number of jobs waiting for the worker.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}
