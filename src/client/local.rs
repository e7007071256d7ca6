use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::transport::{ClientError, EventSource, JobApi, PushStream};
use crate::models::job::JobSnapshot;
use crate::models::subject::Subject;
use crate::models::submit::SubmitResult;
use crate::services::gateway::{Gateway, GatewayError};

/// Transport that calls a [`Gateway`] in the same process.
///
/// Used by embedded deployments and by the resync tests, which need the
/// real queue and executor without an HTTP hop.
#[derive(Clone)]
pub struct LocalJobClient {
    gateway: Arc<Gateway>,
    idle_timeout: Duration,
}

impl LocalJobClient {
    pub fn new(gateway: Arc<Gateway>, idle_timeout: Duration) -> Self {
        Self {
            gateway,
            idle_timeout,
        }
    }
}

impl From<GatewayError> for ClientError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Validation(fields) => ClientError::Validation(fields),
            GatewayError::Store(e) => ClientError::Server {
                status: 500,
                message: e.to_string(),
            },
            GatewayError::Verifier(e) => ClientError::Server {
                status: 502,
                message: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl JobApi for LocalJobClient {
    async fn submit(&self, subject: &Subject) -> Result<SubmitResult, ClientError> {
        Ok(self.gateway.submit(subject.clone()).await?)
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, ClientError> {
        Ok(self.gateway.get_status(job_id).await?)
    }
}

#[async_trait]
impl EventSource for LocalJobClient {
    async fn subscribe(&self, job_id: Uuid) -> Result<PushStream, ClientError> {
        let mut stream = self.gateway.subscribe(job_id, self.idle_timeout).await?;
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(async move {
            while let Some(event) = stream.next_event().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(PushStream::new(rx, task))
    }
}
