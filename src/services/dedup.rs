use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

/// Index of subjects that currently own an active job.
///
/// `try_acquire` is the atomic check-then-claim step for the active-job
/// invariant: the job record is only created after the claim succeeds.
#[derive(Default)]
pub struct SubjectLocks {
    active: Mutex<HashMap<String, Uuid>>,
}

impl SubjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `subject_key` for `job_id`. Returns the current holder when the
    /// subject is already locked.
    pub fn try_acquire(&self, subject_key: &str, job_id: Uuid) -> Result<(), Uuid> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(subject_key) {
            Some(holder) => Err(*holder),
            None => {
                active.insert(subject_key.to_string(), job_id);
                Ok(())
            }
        }
    }

    /// Release the lock if `job_id` still holds it.
    pub fn release(&self, subject_key: &str, job_id: Uuid) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.get(subject_key) == Some(&job_id) {
            active.remove(subject_key);
            true
        } else {
            false
        }
    }

    pub fn holder(&self, subject_key: &str) -> Option<Uuid> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject_key)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
