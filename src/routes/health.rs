use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub job_store: ComponentHealth,
    pub rate_limiter: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub backend: &'static str,
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_check<E>(backend: &'static str, started: Instant, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => ComponentHealth {
                backend,
                status: "ok".to_string(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(_) => ComponentHealth {
                backend,
                status: "error".to_string(),
                latency_ms: None,
            },
        }
    }
}

/// GET /health: health check with dependency status.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store = state.gateway.store();
    let start = Instant::now();
    let store_check = ComponentHealth::from_check(store.backend(), start, store.health_check().await);

    let limiter = state.gateway.limiter();
    let limiter_start = Instant::now();
    let limiter_check =
        ComponentHealth::from_check(limiter.backend(), limiter_start, limiter.health_check().await);

    let all_healthy = store_check.status == "ok" && limiter_check.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            job_store: store_check,
            rate_limiter: limiter_check,
        },
    };

    (status_code, Json(response))
}
