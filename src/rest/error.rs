use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::error;

/// Error surface of both HTTP planes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("access denied")]
    AccessDenied,
    /// Stale `expectedVersion`; carries the latest snapshot for retry.
    #[error("version mismatch")]
    VersionMismatch(Value),
    #[error("{0}")]
    Validation(String),
    /// The machine's runner link is gone or did not answer in time.
    #[error("{0}")]
    RunnerUnavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({"error": "not-found"}))).into_response()
            }
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
            }
            ApiError::AccessDenied => {
                (StatusCode::FORBIDDEN, Json(json!({"error": "access-denied"}))).into_response()
            }
            ApiError::VersionMismatch(snapshot) => {
                // The latest snapshot rides along so the caller can retry
                // against the current version.
                let mut body = match snapshot {
                    Value::Object(map) => Value::Object(map),
                    other => json!({"latest": other}),
                };
                body["error"] = Value::String("version_mismatch".to_string());
                (StatusCode::CONFLICT, Json(body)).into_response()
            }
            ApiError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
            }
            ApiError::RunnerUnavailable(msg) => {
                (StatusCode::BAD_GATEWAY, Json(json!({"error": msg}))).into_response()
            }
            ApiError::Internal(e) => {
                error!(err = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}
