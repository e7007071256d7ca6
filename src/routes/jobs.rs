use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{AppError, AppResult};
use crate::models::event::JobEvent;
use crate::models::job::JobSnapshot;
use crate::models::subject::Subject;
use crate::models::submit::SubmitResult;

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(flatten)]
    pub subject: Subject,
    /// Base64-encoded document to analyze.
    #[serde(default)]
    pub document: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub rate_limit_max_submissions: u32,
    pub rate_limit_window_secs: u64,
    pub post_completion_route: String,
}

/// POST /jobs: submit a subject for carrier verification.
pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<Subject>, JsonRejection>,
) -> AppResult<Response> {
    let Json(subject) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let result = state.gateway.submit(subject).await?;
    Ok(submit_response(&result))
}

/// POST /jobs/analyze: synchronous document analysis, bypasses the queue.
pub async fn analyze_document(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let document = base64::engine::general_purpose::STANDARD
        .decode(request.document.trim())
        .map_err(|e| AppError::BadRequest(format!("document is not valid base64: {e}")))?;
    if document.is_empty() {
        return Err(AppError::BadRequest("document is required".to_string()));
    }
    let result = state.gateway.analyze(request.subject, &document).await?;
    Ok(submit_response(&result))
}

/// GET /jobs/{job_id}: current job state.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobSnapshot>> {
    state
        .gateway
        .get_status(job_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {job_id} not found")))
}

/// GET /jobs/{job_id}/events: server-sent progress events.
///
/// The first event is always the job's current state. The stream closes
/// after `completed`, `failed`, `timeout` or `error`.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let stream = state
        .gateway
        .subscribe(job_id, state.settings.sse_idle_timeout)
        .await?;
    tracing::debug!(job_id = %job_id, "Push subscription opened");

    let events = stream.into_stream().map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.settings.sse_keepalive)))
}

/// GET /config: client-facing service settings.
pub async fn client_config(State(state): State<AppState>) -> Json<ClientConfig> {
    Json(ClientConfig {
        rate_limit_max_submissions: state.settings.rate_limit.max_submissions,
        rate_limit_window_secs: state.settings.rate_limit.window.as_secs(),
        post_completion_route: state.settings.post_completion_route.clone(),
    })
}

fn submit_response(result: &SubmitResult) -> Response {
    let (status, body) = result.to_wire();
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(body)).into_response();
    if let SubmitResult::RateLimited {
        retry_after_seconds,
    } = result
    {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_seconds));
    }
    response
}

fn sse_event(event: &JobEvent) -> Event {
    match event.payload() {
        Ok(payload) => Event::default().event(event.name()).data(payload.to_string()),
        Err(e) => Event::default()
            .event("error")
            .data(json!({ "message": e.to_string() }).to_string()),
    }
}
