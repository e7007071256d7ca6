use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod health;
pub mod jobs;
pub mod metrics;

/// Job and health endpoints. `/metrics` and the tower layers are added by
/// the binary.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/config", get(jobs::client_config))
        .route("/jobs", post(jobs::submit_job))
        .route("/jobs/analyze", post(jobs::analyze_document))
        .route("/jobs/{job_id}", get(jobs::get_job_status))
        .route("/jobs/{job_id}/events", get(jobs::job_events))
        .with_state(state)
}
