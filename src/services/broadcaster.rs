//! Fan-out of job events to push subscribers.
//!
//! Each active job gets its own `tokio::sync::broadcast` channel, opened when
//! the job is created and closed right after its terminal event. The
//! broadcaster only relays what the executor has already written to the job
//! store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::event::JobEvent;

/// Per-job buffer. Events carry full snapshots, so a lagging subscriber
/// only loses intermediate states.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
pub struct ProgressBroadcaster {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<JobEvent>>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting subscriptions for a job. Idempotent.
    pub fn open(&self, job_id: Uuid) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
    }

    /// Subscribe to a job's events. `None` once the job has finished (or was
    /// never opened); callers fall back to the job store in that case.
    pub fn subscribe(&self, job_id: Uuid) -> Option<broadcast::Receiver<JobEvent>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .map(broadcast::Sender::subscribe)
    }

    /// Send an event to every current subscriber of the job. Returns the
    /// number of subscribers reached.
    pub fn publish(&self, job_id: Uuid, event: JobEvent) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        match channels.get(&job_id) {
            // A send error only means there are no receivers.
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Publish the job's terminal event, then close the channel. Subscribers
    /// drain the terminal event and then observe the end of the stream.
    pub fn finish(&self, job_id: Uuid, event: JobEvent) -> usize {
        let sender = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
        match sender {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub fn has_subscribers(&self, job_id: Uuid) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .is_some_and(|sender| sender.receiver_count() > 0)
    }

    /// Number of jobs currently open for subscription.
    pub fn open_channels(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
