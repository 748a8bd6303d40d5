//! REST endpoints for job submission, polling and result download.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::debug;

use super::error::{ApiError, ApiResult};
use crate::error::{JobError, StorageError};
use crate::jobs::{TaskId, TaskState};
use crate::service::{ResultLookup, SwapService, TaskStatusView, Upload};

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<SwapService>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: TaskId,
    status: TaskState,
}

/// POST /swap
///
/// Multipart body with `source_image` and `target_image` file fields.
/// Answers 202 with the new task id; 400 on bad input, 503 when the queue is full.
async fn submit_swap(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let mut source = None;
    let mut target = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        match name.as_str() {
            "source_image" => source = Some(Upload::new(file_name, field.bytes().await?.to_vec())),
            "target_image" => target = Some(Upload::new(file_name, field.bytes().await?.to_vec())),
            other => debug!(field = other, "Ignoring unknown multipart field"),
        }
    }

    let source = source.ok_or_else(|| missing_field("source_image"))?;
    let target = target.ok_or_else(|| missing_field("target_image"))?;

    let task_id = state.service.submit_job(source, target).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            task_id,
            status: TaskState::Pending,
        }),
    ))
}

fn missing_field(name: &str) -> ApiError {
    JobError::InvalidInput(format!("missing multipart field '{name}'")).into()
}

fn parse_task_id(raw: &str) -> ApiResult<TaskId> {
    raw.parse()
        .map_err(|_| JobError::InvalidInput(format!("'{raw}' is not a valid task id")).into())
}

/// GET /status/{task_id}
async fn get_status(
    State(state): State<ApiState>,
    UrlPath(task_id): UrlPath<String>,
) -> ApiResult<Json<TaskStatusView>> {
    let id = parse_task_id(&task_id)?;
    Ok(Json(state.service.get_status(id).await?))
}

/// GET /result/{task_id}
///
/// Returns the output image once the task succeeded, 409 before that.
async fn get_result(
    State(state): State<ApiState>,
    UrlPath(task_id): UrlPath<String>,
) -> ApiResult<Response> {
    let id = parse_task_id(&task_id)?;
    let path = match state.service.result_path(id).await? {
        ResultLookup::Ready(path) => path,
        ResultLookup::NotReady(task_state) => return Err(ApiError::NotReady(task_state)),
    };

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| JobError::Io(StorageError::io(&path, e)))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("result")
        .to_string();

    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&path).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// GET /health
///
/// 200 while storage is writable and the dispatcher runs, 503 otherwise.
async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let report = state.service.health().await;
    let status = if report.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// GET /stats
async fn stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.service.stats().await)
}

/// Build the job routes (unprefixed).
pub fn job_routes(state: ApiState) -> Router {
    Router::new()
        .route("/swap", post(submit_swap))
        .route("/status/{task_id}", get(get_status))
        .route("/result/{task_id}", get(get_result))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}
