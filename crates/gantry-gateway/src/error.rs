//! Gateway error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use gantry_kernel::error::GantryError;

/// HTTP-facing error wrapper around the control-plane taxonomy.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gantry(#[from] GantryError),

    #[error("missing X-Internal-API-Key header")]
    MissingApiKey,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("internal API key not configured")]
    ApiKeyUnconfigured,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Gantry(err) => match err {
                GantryError::QueueFull { .. } | GantryError::QueueShutdown => {
                    (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_FULL")
                }
                GantryError::BudgetExceeded { .. } => {
                    (StatusCode::TOO_MANY_REQUESTS, "BUDGET_EXCEEDED")
                }
                GantryError::UnknownModel(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_MODEL"),
                GantryError::InsufficientVram { .. } => {
                    (StatusCode::CONFLICT, "INSUFFICIENT_VRAM")
                }
                GantryError::CircuitOpen { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN")
                }
                GantryError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
                GantryError::Engine(_) => (StatusCode::BAD_GATEWAY, "ENGINE_ERROR"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            ApiError::MissingApiKey => (StatusCode::UNAUTHORIZED, "MISSING_API_KEY"),
            ApiError::InvalidApiKey => (StatusCode::FORBIDDEN, "INVALID_API_KEY"),
            ApiError::ApiKeyUnconfigured => {
                (StatusCode::INTERNAL_SERVER_ERROR, "API_KEY_UNCONFIGURED")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
