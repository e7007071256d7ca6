use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::models::subject::FieldError;
use crate::services::gateway::GatewayError;
use crate::services::store::StoreError;
use crate::services::verifier::VerifierError;

/// Error type for HTTP handlers.
///
/// Every variant renders as `{"error": ..., "code": ...}`; validation
/// failures additionally list each offending field.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Gateway(GatewayError::Validation(fields)) => {
                return validation_response(fields);
            }
            AppError::Gateway(GatewayError::Store(StoreError::NotFound(id))) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("job {id} not found"),
            ),
            AppError::Gateway(GatewayError::Store(err)) => {
                tracing::error!(error = %err, "Job store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Gateway(GatewayError::Verifier(VerifierError::Unsupported)) => (
                StatusCode::NOT_IMPLEMENTED,
                "UNSUPPORTED",
                VerifierError::Unsupported.to_string(),
            ),
            AppError::Gateway(GatewayError::Verifier(err)) => {
                tracing::warn!(error = %err, "Verification service error");
                (StatusCode::BAD_GATEWAY, "VERIFIER_ERROR", err.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn validation_response(fields: &[FieldError]) -> Response {
    let body = json!({
        "error": "Invalid verification request",
        "code": "VALIDATION_ERROR",
        "fieldErrors": fields,
    });
    (StatusCode::BAD_REQUEST, axum::Json(body)).into_response()
}
