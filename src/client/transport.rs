//! How the client reaches the job API.
//!
//! [`JobApi`] covers submit and status reads, [`EventSource`] opens push
//! subscriptions. [`HttpJobClient`] implements both over HTTP; the
//! in-process implementation lives in [`crate::client::local`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::storage::KeyValueError;
use crate::models::event::JobEvent;
use crate::models::job::JobSnapshot;
use crate::models::subject::{FieldError, Subject};
use crate::models::submit::SubmitResult;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PUSH_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Submission rejected: {} invalid field(s)", .0.len())]
    Validation(Vec<FieldError>),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Could not decode server response: {0}")]
    Decode(String),

    #[error("No push transport configured")]
    NoPushTransport,

    #[error(transparent)]
    Storage(#[from] KeyValueError),
}

impl ClientError {
    /// Errors worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Timeout => true,
            ClientError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Network(e.to_string())
        }
    }
}

#[async_trait]
pub trait JobApi: Send + Sync {
    async fn submit(&self, subject: &Subject) -> Result<SubmitResult, ClientError>;

    /// `Ok(None)` when the job does not exist.
    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, ClientError>;
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, job_id: Uuid) -> Result<PushStream, ClientError>;
}

/// Events from one push subscription. Dropping it closes the subscription.
pub struct PushStream {
    events: mpsc::Receiver<JobEvent>,
    task: JoinHandle<()>,
}

impl PushStream {
    pub fn new(events: mpsc::Receiver<JobEvent>, task: JoinHandle<()>) -> Self {
        Self { events, task }
    }

    /// Next event; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Handles events split across chunks, CRLF line endings, comments and
/// multi-line data. `id` and `retry` fields are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    messages.push(SseMessage {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: self.data.join("\n"),
                    });
                }
                self.event = None;
                self.data.clear();
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        messages
    }
}

/// HTTP client for the job API.
#[derive(Clone)]
pub struct HttpJobClient {
    http: Client,
    base_url: String,
    idle_timeout: Duration,
}

impl HttpJobClient {
    /// `idle_timeout` bounds the silence on a push subscription, keep-alive
    /// comments included.
    pub fn new(base_url: &str, idle_timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("carrier-verify-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            idle_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_body(response: reqwest::Response) -> Result<(u16, Value), ClientError> {
        let status = response.status().as_u16();
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok((status, Value::Null));
        }
        let body = serde_json::from_str(&text).map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok((status, body))
    }
}

fn server_error(status: u16, body: &Value) -> ClientError {
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unexpected response")
        .to_string();
    ClientError::Server { status, message }
}

#[async_trait]
impl JobApi for HttpJobClient {
    async fn submit(&self, subject: &Subject) -> Result<SubmitResult, ClientError> {
        let response = self
            .http
            .post(self.url("/jobs"))
            .timeout(REQUEST_TIMEOUT)
            .json(subject)
            .send()
            .await?;
        let (status, body) = Self::read_body(response).await?;

        if status == StatusCode::BAD_REQUEST.as_u16() {
            if let Some(fields) = body.get("fieldErrors") {
                let fields: Vec<FieldError> = serde_json::from_value(fields.clone())
                    .map_err(|e| ClientError::Decode(e.to_string()))?;
                return Err(ClientError::Validation(fields));
            }
        }
        SubmitResult::from_wire(status, &body).ok_or_else(|| server_error(status, &body))
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{job_id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let (status, body) = Self::read_body(response).await?;
        if !(200..300).contains(&status) {
            return Err(server_error(status, &body));
        }
        serde_json::from_value(body)
            .map(Some)
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl EventSource for HttpJobClient {
    async fn subscribe(&self, job_id: Uuid) -> Result<PushStream, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{job_id}/events")))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            let (status, body) = Self::read_body(response).await?;
            return Err(server_error(status, &body));
        }

        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        let idle_timeout = self.idle_timeout;
        let task = tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut parser = SseParser::new();
            loop {
                let ended = match tokio::time::timeout(idle_timeout, bytes.next()).await {
                    Err(_) => JobEvent::Timeout {
                        message: format!("no server activity for {} seconds", idle_timeout.as_secs()),
                    },
                    Ok(None) => JobEvent::Error {
                        message: "event stream closed by server".to_string(),
                    },
                    Ok(Some(Err(e))) => JobEvent::Error {
                        message: format!("event stream interrupted: {e}"),
                    },
                    Ok(Some(Ok(chunk))) => {
                        for message in parser.feed(&chunk) {
                            let event = match JobEvent::from_wire(&message.event, &message.data) {
                                Ok(Some(event)) => event,
                                Ok(None) => continue,
                                Err(e) => JobEvent::Error {
                                    message: format!("undecodable {} event: {e}", message.event),
                                },
                            };
                            let last = event.is_final();
                            if tx.send(event).await.is_err() || last {
                                return;
                            }
                        }
                        continue;
                    }
                };
                let _ = tx.send(ended).await;
                return;
            }
        });

        Ok(PushStream::new(rx, task))
    }
}
