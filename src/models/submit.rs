use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::job::JobStatus;

/// Outcome of a verification submission.
///
/// Every accepted or refused submission maps to exactly one variant;
/// validation failures are reported separately as field errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitResult {
    /// Synchronous analysis that bypassed the queue.
    Immediate { analysis: Value },
    /// Accepted and waiting behind `position` other jobs.
    Queued { job_id: Uuid, position: u32 },
    /// Accepted and handed straight to the idle worker.
    Processing { job_id: Uuid },
    /// The subject already has an active job; resume tracking it.
    Conflict { job_id: Uuid, status: JobStatus },
    /// Too many submissions for this subject in the current window.
    RateLimited { retry_after_seconds: u64 },
}

impl SubmitResult {
    /// The job a client should track after this submission, if any.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            SubmitResult::Queued { job_id, .. }
            | SubmitResult::Processing { job_id }
            | SubmitResult::Conflict { job_id, .. } => Some(*job_id),
            SubmitResult::Immediate { .. } | SubmitResult::RateLimited { .. } => None,
        }
    }

    /// HTTP status code and JSON body for this result.
    pub fn to_wire(&self) -> (u16, Value) {
        match self {
            SubmitResult::Immediate { analysis } => {
                (200, json!({ "success": true, "analysis": analysis }))
            }
            SubmitResult::Queued { job_id, position } => (
                200,
                json!({ "queued": true, "jobId": job_id, "position": position }),
            ),
            SubmitResult::Processing { job_id } => {
                (200, json!({ "processing": true, "jobId": job_id }))
            }
            SubmitResult::Conflict { job_id, status } => {
                (409, json!({ "jobId": job_id, "status": status }))
            }
            SubmitResult::RateLimited {
                retry_after_seconds,
            } => (429, json!({ "retryAfterSeconds": retry_after_seconds })),
        }
    }

    /// Decode a response produced by [`SubmitResult::to_wire`].
    pub fn from_wire(status: u16, body: &Value) -> Option<Self> {
        let job_id = || {
            body.get("jobId")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
        };
        match status {
            200 if body.get("success").and_then(Value::as_bool) == Some(true) => {
                Some(SubmitResult::Immediate {
                    analysis: body.get("analysis").cloned().unwrap_or(Value::Null),
                })
            }
            200 if body.get("queued").and_then(Value::as_bool) == Some(true) => {
                Some(SubmitResult::Queued {
                    job_id: job_id()?,
                    position: u32::try_from(body.get("position")?.as_u64()?).ok()?,
                })
            }
            200 if body.get("processing").and_then(Value::as_bool) == Some(true) => {
                Some(SubmitResult::Processing { job_id: job_id()? })
            }
            409 => Some(SubmitResult::Conflict {
                job_id: job_id()?,
                status: serde_json::from_value(body.get("status")?.clone()).ok()?,
            }),
            429 => Some(SubmitResult::RateLimited {
                retry_after_seconds: body.get("retryAfterSeconds")?.as_u64()?,
            }),
            _ => None,
        }
    }
}
