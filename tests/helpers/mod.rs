//! Test helper utilities for job API and resync tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use uuid::Uuid;

use carrier_verify::app_state::{AppState, ServiceSettings};
use carrier_verify::client::transport::{ClientError, JobApi};
use carrier_verify::models::job::JobSnapshot;
use carrier_verify::models::subject::Subject;
use carrier_verify::models::submit::SubmitResult;
use carrier_verify::routes;
use carrier_verify::services::{
    broadcaster::ProgressBroadcaster,
    dedup::SubjectLocks,
    executor::JobExecutor,
    gateway::Gateway,
    queue::JobQueue,
    rate_limit::{RateLimitPolicy, SlidingWindowLimiter},
    store::{JobStore, MemoryJobStore},
    verifier::{ProgressReporter, VerificationOutcome, Verifier, VerifierError},
};

use crate::fixtures::EXPECTED_CARRIERS;

/// Releases held verification runs one at a time.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn release(&self) {
        self.0.add_permits(1);
    }

    pub fn release_all(&self, runs: usize) {
        self.0.add_permits(runs);
    }
}

/// Verifier that reports fixed progress steps, optionally waits at a gate,
/// then succeeds or fails.
pub struct ScriptedVerifier {
    steps: Vec<(u8, &'static str)>,
    failure: Option<String>,
    gate: Option<Gate>,
    calls: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn succeeding() -> Self {
        Self {
            steps: vec![(35, "logging in to carrier portal"), (80, "matching appointments")],
            failure: None,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::succeeding()
        }
    }

    /// Hold every run after its progress steps until the gate is released.
    pub fn gated(mut self) -> (Self, Gate) {
        let gate = Gate(Arc::new(Semaphore::new(0)));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn execute(
        &self,
        _subject: &Subject,
        progress: ProgressReporter,
    ) -> Result<VerificationOutcome, VerifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for (percent, message) in &self.steps {
            progress.report(*percent, *message);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if let Some(gate) = &self.gate {
            gate.0.acquire().await.expect("gate closed").forget();
        }
        match &self.failure {
            Some(message) => Err(VerifierError::Site(message.clone())),
            None => Ok(VerificationOutcome {
                carriers: EXPECTED_CARRIERS.iter().map(|c| c.to_string()).collect(),
                files: vec!["appointments/aetna.pdf".to_string()],
            }),
        }
    }

    async fn analyze_document(
        &self,
        subject: &Subject,
        document: &[u8],
    ) -> Result<Value, VerifierError> {
        Ok(serde_json::json!({
            "npn": subject.npn,
            "bytes": document.len(),
            "carriers": EXPECTED_CARRIERS,
        }))
    }
}

/// A fully wired service with an in-memory store and a running worker.
pub struct TestApp {
    pub router: Router,
    pub gateway: Arc<Gateway>,
    pub store: Arc<MemoryJobStore>,
    pub verifier: Arc<ScriptedVerifier>,
    worker: JoinHandle<()>,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

pub fn default_policy() -> RateLimitPolicy {
    RateLimitPolicy {
        max_submissions: 5,
        window: Duration::from_secs(3600),
    }
}

pub fn settings(policy: RateLimitPolicy) -> ServiceSettings {
    ServiceSettings {
        sse_idle_timeout: Duration::from_secs(5),
        sse_keepalive: Duration::from_secs(15),
        rate_limit: policy,
        post_completion_route: "results".to_string(),
    }
}

/// Build and start a service around `verifier`. Must run inside a Tokio runtime.
pub fn spawn_app(verifier: ScriptedVerifier, policy: RateLimitPolicy) -> TestApp {
    spawn_app_with_store(verifier, policy, Arc::new(MemoryJobStore::new()))
}

pub fn spawn_app_with_store(
    verifier: ScriptedVerifier,
    policy: RateLimitPolicy,
    store: Arc<MemoryJobStore>,
) -> TestApp {
    let verifier = Arc::new(verifier);
    let queue = Arc::new(JobQueue::new());
    let locks = Arc::new(SubjectLocks::new());
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let job_store: Arc<dyn JobStore> = store.clone();

    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&job_store),
        Arc::clone(&queue),
        Arc::clone(&locks),
        Arc::clone(&broadcaster),
        verifier.clone(),
        Duration::from_secs(10),
    ));
    let worker = executor.spawn();

    let gateway = Arc::new(Gateway::new(
        job_store,
        locks,
        queue,
        Arc::new(SlidingWindowLimiter::new(policy)),
        broadcaster,
        verifier.clone(),
    ));
    let router = routes::api_router(AppState::new(Arc::clone(&gateway), settings(policy)));

    TestApp {
        router,
        gateway,
        store,
        verifier,
        worker,
    }
}

/// Send a request through the router and decode the JSON body.
pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("router error");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body read failed");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

pub async fn post_json(router: &Router, path: &str, body: &Value) -> (StatusCode, Value) {
    let request = Request::post(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    send(router, request).await
}

pub async fn get_json(router: &Router, path: &str) -> (StatusCode, Value) {
    let request = Request::get(path).body(Body::empty()).expect("request");
    send(router, request).await
}

/// Read an SSE response to its end and return `(event, data)` pairs.
pub async fn read_events(router: &Router, path: &str) -> Vec<(String, Value)> {
    let request = Request::get(path).body(Body::empty()).expect("request");
    let response = router.clone().oneshot(request).await.expect("router error");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body read failed");

    let mut parser = carrier_verify::client::transport::SseParser::new();
    parser
        .feed(&bytes)
        .into_iter()
        .map(|m| {
            let data = serde_json::from_str(&m.data).expect("event data is JSON");
            (m.event, data)
        })
        .collect()
}

pub fn job_id_of(body: &Value) -> Uuid {
    body["jobId"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .expect("response carries a jobId")
}

/// Poll the gateway until `done` holds for the job's snapshot.
pub async fn wait_for(
    gateway: &Gateway,
    job_id: Uuid,
    done: impl Fn(&JobSnapshot) -> bool,
) -> JobSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = gateway
            .get_status(job_id)
            .await
            .expect("status read failed")
            .expect("job exists");
        if done(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on job {job_id}; last seen {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wraps a [`JobApi`] and counts calls.
pub struct CountingApi<A> {
    inner: A,
    pub submits: AtomicUsize,
    pub status_reads: AtomicUsize,
}

impl<A> CountingApi<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            submits: AtomicUsize::new(0),
            status_reads: AtomicUsize::new(0),
        }
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn status_reads(&self) -> usize {
        self.status_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<A: JobApi> JobApi for CountingApi<A> {
    async fn submit(&self, subject: &Subject) -> Result<SubmitResult, ClientError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        self.inner.submit(subject).await
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<JobSnapshot>, ClientError> {
        self.status_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_status(job_id).await
    }
}
