use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::job::{JobSnapshot, JobStatus};

/// A push event for one job.
///
/// A subscription yields zero or more `Progress` events followed by exactly
/// one final event (`Completed`, `Failed`, `Timeout` or `Error`).
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress(JobSnapshot),
    Completed(JobSnapshot),
    Failed(JobSnapshot),
    /// No server activity within the subscription's idle window.
    Timeout { message: String },
    /// The subscription could not continue (unknown job, channel closed).
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct NoticePayload {
    message: String,
}

impl JobEvent {
    /// Event matching a snapshot's status.
    pub fn from_snapshot(snapshot: JobSnapshot) -> Self {
        match snapshot.status {
            JobStatus::Pending | JobStatus::Processing => JobEvent::Progress(snapshot),
            JobStatus::Completed => JobEvent::Completed(snapshot),
            JobStatus::Failed => JobEvent::Failed(snapshot),
        }
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Progress(_) => "progress",
            JobEvent::Completed(_) => "completed",
            JobEvent::Failed(_) => "failed",
            JobEvent::Timeout { .. } => "timeout",
            JobEvent::Error { .. } => "error",
        }
    }

    /// True for every event after which the stream is closed.
    pub fn is_final(&self) -> bool {
        !matches!(self, JobEvent::Progress(_))
    }

    pub fn snapshot(&self) -> Option<&JobSnapshot> {
        match self {
            JobEvent::Progress(s) | JobEvent::Completed(s) | JobEvent::Failed(s) => Some(s),
            JobEvent::Timeout { .. } | JobEvent::Error { .. } => None,
        }
    }

    /// JSON carried in the SSE `data:` field.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            JobEvent::Progress(s) | JobEvent::Completed(s) | JobEvent::Failed(s) => {
                serde_json::to_value(s)
            }
            JobEvent::Timeout { message } | JobEvent::Error { message } => {
                serde_json::to_value(NoticePayload {
                    message: message.clone(),
                })
            }
        }
    }

    /// Rebuild an event from its SSE name and data. Unknown names yield `None`.
    pub fn from_wire(name: &str, data: &str) -> Result<Option<Self>, serde_json::Error> {
        let event = match name {
            "progress" => JobEvent::Progress(serde_json::from_str(data)?),
            "completed" => JobEvent::Completed(serde_json::from_str(data)?),
            "failed" => JobEvent::Failed(serde_json::from_str(data)?),
            "timeout" => {
                let notice: NoticePayload = serde_json::from_str(data)?;
                JobEvent::Timeout {
                    message: notice.message,
                }
            }
            "error" => {
                let notice: NoticePayload = serde_json::from_str(data)?;
                JobEvent::Error {
                    message: notice.message,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
