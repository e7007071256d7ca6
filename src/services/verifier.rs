use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::models::subject::Subject;

/// A progress report from a running verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub message: String,
}

/// Handle a verifier uses to report progress while it runs.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self { tx }
    }

    pub fn report(&self, percent: u8, message: impl Into<String>) {
        // The executor may already have given up on this run.
        let _ = self.tx.send(ProgressUpdate {
            percent,
            message: message.into(),
        });
    }
}

/// Result of a successful verification run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    #[serde(default)]
    pub carriers: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Verification site reported a failure: {0}")]
    Site(String),

    #[error("Unexpected response from verification service: {0}")]
    UnexpectedResponse(String),

    #[error("Verification timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("Document analysis is not supported by this verifier")]
    Unsupported,
}

/// The external verification automation.
///
/// Runs are non-reentrant: the executor never calls `execute` concurrently.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn execute(
        &self,
        subject: &Subject,
        progress: ProgressReporter,
    ) -> Result<VerificationOutcome, VerifierError>;

    /// Synchronous analysis of an uploaded document, bypassing the queue.
    async fn analyze_document(
        &self,
        _subject: &Subject,
        _document: &[u8],
    ) -> Result<Value, VerifierError> {
        Err(VerifierError::Unsupported)
    }
}

/// Client for the verification automation service.
pub struct HttpVerifier {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct ServiceFailure {
    error: String,
}

impl HttpVerifier {
    pub fn new(base_url: &str, api_token: Option<String>) -> Result<Self, VerifierError> {
        let http = Client::builder()
            .user_agent(concat!("carrier-verify/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.post(format!("{}{}", self.base_url, path));
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, VerifierError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<ServiceFailure>(&body)
                .map(|f| f.error)
                .unwrap_or_else(|_| format!("HTTP {status}"));
            return Err(VerifierError::Site(message));
        }
        serde_json::from_str(&body).map_err(|e| VerifierError::UnexpectedResponse(e.to_string()))
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn execute(
        &self,
        subject: &Subject,
        progress: ProgressReporter,
    ) -> Result<VerificationOutcome, VerifierError> {
        progress.report(5, "submitting producer details");

        let response = self.post("/verifications").json(subject).send().await?;
        progress.report(90, "reading carrier appointments");

        let body = Self::read_json(response).await?;
        if let Ok(failure) = serde_json::from_value::<ServiceFailure>(body.clone()) {
            return Err(VerifierError::Site(failure.error));
        }
        serde_json::from_value(body).map_err(|e| VerifierError::UnexpectedResponse(e.to_string()))
    }

    async fn analyze_document(
        &self,
        subject: &Subject,
        document: &[u8],
    ) -> Result<Value, VerifierError> {
        let body = serde_json::json!({
            "subject": subject,
            "document": base64::engine::general_purpose::STANDARD.encode(document),
        });
        let response = self.post("/analyses").json(&body).send().await?;
        Self::read_json(response).await
    }
}
