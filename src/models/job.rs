use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::subject::Subject;

/// Status of a carrier verification job.
///
/// Jobs only move forward: `Pending -> Processing -> Completed | Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// `Pending` or `Processing`: the job holds its subject's lock.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// Whether `self` lies strictly further along the lifecycle than `other`.
    pub fn is_ahead_of(self, other: JobStatus) -> bool {
        self.rank() > other.rank()
    }
}

/// A change applied to a job by the queue or the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The job reached the head of the queue and was claimed by the worker.
    Start,
    /// Progress reported by the external verification run.
    Progress { percent: u8, message: String },
    /// The verification run succeeded.
    Complete {
        carriers: Vec<String>,
        files: Vec<String>,
    },
    /// The verification run failed or was interrupted.
    Fail { message: String },
    /// The job's place in the queue changed.
    Reposition { position: u32 },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidStatus {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {job_id} is {status}; progress is only accepted while processing")]
    NotProcessing { job_id: Uuid, status: JobStatus },

    #[error("job {job_id} is {status}; queue position is only tracked while pending")]
    NotPending { job_id: Uuid, status: JobStatus },
}

/// A carrier verification job for one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationJob {
    pub id: Uuid,
    pub subject_key: String,
    pub subject: Subject,
    pub status: JobStatus,
    pub queue_position: u32,
    pub progress: u8,
    pub progress_message: Option<String>,
    pub result_carriers: Vec<String>,
    pub result_files: Vec<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VerificationJob {
    /// Create a new pending job for `subject`.
    pub fn new(subject: Subject) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            subject_key: subject.key(),
            subject,
            status: JobStatus::Pending,
            queue_position: 0,
            progress: 0,
            progress_message: None,
            result_carriers: Vec::new(),
            result_files: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Apply a transition in place, enforcing forward-only status and
    /// monotonic progress. On error the job is left untouched.
    pub fn apply(&mut self, transition: Transition) -> Result<(), TransitionError> {
        match transition {
            Transition::Start => {
                self.require(JobStatus::Pending, JobStatus::Processing)?;
                self.status = JobStatus::Processing;
                self.queue_position = 0;
                self.progress_message = Some("starting".to_string());
            }
            Transition::Progress { percent, message } => {
                if self.status != JobStatus::Processing {
                    return Err(TransitionError::NotProcessing {
                        job_id: self.id,
                        status: self.status,
                    });
                }
                // Never regress; the message is always latest-wins.
                self.progress = self.progress.max(percent.min(100));
                self.progress_message = Some(message);
            }
            Transition::Complete { carriers, files } => {
                self.require(JobStatus::Processing, JobStatus::Completed)?;
                self.status = JobStatus::Completed;
                self.progress = 100;
                self.progress_message = Some("completed".to_string());
                self.result_carriers = carriers;
                self.result_files = files;
                self.completed_at = Some(Utc::now());
            }
            Transition::Fail { message } => {
                self.require(JobStatus::Processing, JobStatus::Failed)?;
                self.status = JobStatus::Failed;
                self.progress_message = Some("failed".to_string());
                self.error_message = Some(message);
                self.completed_at = Some(Utc::now());
            }
            Transition::Reposition { position } => {
                if self.status != JobStatus::Pending {
                    return Err(TransitionError::NotPending {
                        job_id: self.id,
                        status: self.status,
                    });
                }
                self.queue_position = position;
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    fn require(&self, from: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
        if self.status == from {
            Ok(())
        } else {
            Err(TransitionError::InvalidStatus {
                job_id: self.id,
                from: self.status,
                to,
            })
        }
    }

    /// Client-facing view of the job, as served by the status endpoint.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            status: self.status,
            progress: self.progress,
            progress_message: self.progress_message.clone(),
            position: (self.status == JobStatus::Pending).then_some(self.queue_position),
            result_files: self.result_files.clone(),
            result_carriers: self.result_carriers.clone(),
            error_message: self.error_message.clone(),
            completed_at: self.completed_at,
        }
    }
}

/// Status response body; also the payload of every push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub progress_message: Option<String>,
    pub position: Option<u32>,
    #[serde(default)]
    pub result_files: Vec<String>,
    #[serde(default)]
    pub result_carriers: Vec<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    /// Combine two observations of the same job so that neither status nor
    /// progress ever moves backwards. `newer` wins on free-text fields unless
    /// it is behind `self` in the lifecycle.
    pub fn merge(&self, newer: JobSnapshot) -> JobSnapshot {
        if self.status.is_ahead_of(newer.status) {
            return self.clone();
        }
        let mut merged = newer;
        merged.progress = merged.progress.max(self.progress);
        if let (Some(old), Some(new)) = (self.position, merged.position) {
            merged.position = Some(old.min(new));
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::subject::tests::sample_subject;

    fn processing_job() -> VerificationJob {
        let mut job = VerificationJob::new(sample_subject());
        job.apply(Transition::Start).unwrap();
        job
    }

    #[test]
    fn test_new_job_is_pending_and_keyed_by_subject() {
        let job = VerificationJob::new(sample_subject());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.subject_key, "npn:17654321");
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_start_sets_starting_message() {
        let job = processing_job();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress_message.as_deref(), Some("starting"));
    }

    #[test]
    fn test_progress_never_regresses() {
        let mut job = processing_job();
        job.apply(Transition::Progress { percent: 80, message: "checking carriers".into() })
            .unwrap();
        job.apply(Transition::Progress { percent: 35, message: "late update".into() })
            .unwrap();
        assert_eq!(job.progress, 80);
        assert_eq!(job.progress_message.as_deref(), Some("late update"));
    }

    #[test]
    fn test_progress_clamped_to_100() {
        let mut job = processing_job();
        job.apply(Transition::Progress { percent: 250, message: "x".into() }).unwrap();
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_progress_rejected_while_pending() {
        let mut job = VerificationJob::new(sample_subject());
        let err = job
            .apply(Transition::Progress { percent: 10, message: "x".into() })
            .unwrap_err();
        assert!(matches!(err, TransitionError::NotProcessing { .. }));
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn test_complete_forces_full_progress() {
        let mut job = processing_job();
        job.apply(Transition::Complete {
            carriers: vec!["Aetna".into(), "Foresters".into()],
            files: vec!["report.pdf".into()],
        })
        .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result_carriers, vec!["Aetna", "Foresters"]);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_terminal_job_never_reenters_active() {
        let mut job = processing_job();
        job.apply(Transition::Fail { message: "site down".into() }).unwrap();
        assert!(job.apply(Transition::Start).is_err());
        assert!(job
            .apply(Transition::Complete { carriers: vec![], files: vec![] })
            .is_err());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("site down"));
    }

    #[test]
    fn test_cannot_complete_from_pending() {
        let mut job = VerificationJob::new(sample_subject());
        let err = job
            .apply(Transition::Complete { carriers: vec![], files: vec![] })
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::InvalidStatus {
                job_id: job.id,
                from: JobStatus::Pending,
                to: JobStatus::Completed,
            }
        );
    }

    #[test]
    fn test_position_only_visible_while_pending() {
        let mut job = VerificationJob::new(sample_subject());
        job.apply(Transition::Reposition { position: 3 }).unwrap();
        assert_eq!(job.snapshot().position, Some(3));
        job.apply(Transition::Start).unwrap();
        assert_eq!(job.snapshot().position, None);
        assert!(job.apply(Transition::Reposition { position: 1 }).is_err());
    }

    #[test]
    fn test_merge_keeps_most_advanced_status() {
        let mut job = processing_job();
        job.apply(Transition::Progress { percent: 80, message: "almost".into() }).unwrap();
        let ahead = job.snapshot();

        let mut stale = ahead.clone();
        stale.status = JobStatus::Pending;
        stale.progress = 0;

        assert_eq!(ahead.merge(stale), ahead);
    }

    #[test]
    fn test_merge_takes_max_progress() {
        let job = processing_job();
        let mut first = job.snapshot();
        first.progress = 60;
        let mut second = job.snapshot();
        second.progress = 40;
        second.progress_message = Some("newer text".into());

        let merged = first.merge(second);
        assert_eq!(merged.progress, 60);
        assert_eq!(merged.progress_message.as_deref(), Some("newer text"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&JobStatus::Processing).unwrap(), "\"processing\"");
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
    }
}
