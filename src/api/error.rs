use axum::extract::multipart::MultipartError;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::JobError;
use crate::jobs::TaskState;

/// Seconds a shed client is told to wait before retrying.
pub const RETRY_AFTER_SECS: u64 = 5;

/// Error type for HTTP handlers. Renders as `{"error": ..., "code": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Job(#[from] JobError),

    /// The multipart body could not be read.
    #[error("Malformed upload: {0}")]
    Upload(#[from] MultipartError),

    /// The task exists but has no downloadable result.
    #[error("Task is {0}, no result available")]
    NotReady(TaskState),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Job(err) => match err {
                JobError::InvalidInput(msg) => {
                    (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg.clone())
                }
                JobError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
                JobError::Overloaded { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "OVERLOADED", err.to_string())
                }
                JobError::Io(io) => {
                    tracing::error!(error = %io, "Storage failure while handling request");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "IO_ERROR",
                        "A storage error occurred".to_string(),
                    )
                }
                JobError::InvalidTransition { .. } => {
                    tracing::error!(error = %err, "Invalid task transition reached the API");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },
            ApiError::Upload(err) => (err.status(), "INVALID_INPUT", err.body_text()),
            ApiError::NotReady(_) => (StatusCode::CONFLICT, "NOT_READY", self.to_string()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        let mut response = (status, axum::Json(body)).into_response();
        if matches!(&self, ApiError::Job(err) if err.is_retryable()) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        response
    }
}
