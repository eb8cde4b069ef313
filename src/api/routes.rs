//! REST endpoints for dispatch, runners, tasks, and PR actions.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::auth::require_user;
use crate::api::error::ApiError;
use crate::model::{RetryMode, SubtaskStatus};
use crate::pr::gateway::{CreatePullRequestAction, PrActionGateway};
use crate::service::dispatch::{DispatchService, SubtaskExecutorUpdate, SubtaskView};
use crate::service::runners::{HeartbeatRequest, RunnerService};
use crate::service::retry::RetryService;
use crate::service::tasks::{CreateTaskRequest, TaskService};
use crate::store::Store;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatch: Arc<DispatchService>,
    pub tasks: Arc<TaskService>,
    pub runners: Arc<RunnerService>,
    pub retry: Arc<RetryService>,
    pub gateway: Arc<PrActionGateway>,
}

/// Build the axum router.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runners/heartbeat", post(heartbeat))
        .route("/runners", get(list_runners))
        .route("/runners/{runner_id}", put(update_runner))
        .route("/runners/artifacts/upload", post(upload_artifact))
        .route("/dispatch/tasks", post(dispatch_tasks).put(update_subtask))
        .route("/tasks", post(create_task))
        .route(
            "/tasks/{task_id}/subtasks/{subtask_id}/retry",
            post(retry_subtask),
        )
        .route("/pr/actions/create-pr", post(create_pr_action))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "taskforge"
    }))
}

// ── Runners ─────────────────────────────────────────────────────────────

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(state.store.as_ref(), &headers).await?;
    let view = state.runners.heartbeat(user.id, request).await?;
    Ok(Json(view))
}

async fn list_runners(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(state.store.as_ref(), &headers).await?;
    let items = state.runners.list(user.id).await?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Debug, Deserialize)]
struct UpdateRunnerRequest {
    disabled: bool,
}

async fn update_runner(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(runner_id): Path<String>,
    Json(request): Json<UpdateRunnerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(state.store.as_ref(), &headers).await?;
    let view = state
        .runners
        .set_disabled(user.id, &runner_id, request.disabled)
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    runner_id: String,
    subtask_id: i64,
    filename: String,
}

async fn upload_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(state.store.as_ref(), &headers).await?;
    if query.filename.is_empty() {
        return Err(ApiError::bad_request("Filename is required"));
    }

    // Same fail-closed ownership gate as callback updates: nothing is
    // written unless the runner holds the claim.
    state
        .dispatch
        .authorize_artifact_upload(user.id, &query.runner_id, query.subtask_id)
        .await?;

    let artifact_id = state
        .store
        .insert_artifact(user.id, query.subtask_id, &query.filename, &body)
        .await?;

    Ok(Json(json!({
        "id": artifact_id,
        "filename": query.filename,
        "file_size": body.len(),
    })))
}

// ── Dispatch ────────────────────────────────────────────────────────────

fn default_dispatch_status() -> String {
    "PENDING".to_string()
}

fn default_dispatch_limit() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct DispatchQuery {
    runner_id: String,
    #[serde(default = "default_dispatch_status")]
    status: String,
    #[serde(default = "default_dispatch_limit")]
    limit: u32,
}

async fn dispatch_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DispatchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(state.store.as_ref(), &headers).await?;
    let status: SubtaskStatus = query
        .status
        .parse()
        .map_err(|e: String| ApiError::bad_request(e))?;
    let response = state
        .dispatch
        .dispatch_tasks(user.id, &query.runner_id, status, query.limit.max(1))
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct UpdateQuery {
    runner_id: String,
}

async fn update_subtask(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UpdateQuery>,
    Json(update): Json<SubtaskExecutorUpdate>,
) -> Result<Json<SubtaskView>, ApiError> {
    let user = require_user(state.store.as_ref(), &headers).await?;
    let view = state
        .dispatch
        .update_subtask(user.id, &query.runner_id, update)
        .await?;
    Ok(Json(view))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(state.store.as_ref(), &headers).await?;
    let (task, user_subtask, assistant_subtask) =
        state.tasks.create_or_append(&user, request).await?;
    Ok(Json(json!({
        "task_id": task.id,
        "status": task.status,
        "user_subtask_id": user_subtask.id,
        "assistant_subtask_id": assistant_subtask.id,
    })))
}

fn default_retry_mode() -> RetryMode {
    RetryMode::Resume
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    #[serde(default = "default_retry_mode")]
    retry_mode: RetryMode,
}

async fn retry_subtask(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((task_id, subtask_id)): Path<(i64, i64)>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<SubtaskView>, ApiError> {
    let user = require_user(state.store.as_ref(), &headers).await?;
    let subtask = state
        .retry
        .retry_subtask(user.id, task_id, subtask_id, request.retry_mode)
        .await?;
    Ok(Json(SubtaskView::from_subtask(subtask)))
}

// ── PR actions ──────────────────────────────────────────────────────────

async fn create_pr_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(action): Json<CreatePullRequestAction>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(state.store.as_ref(), &headers).await?;
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ApiError::bad_request("Idempotency-Key header is required"))?;

    let result = state
        .gateway
        .create_pull_request(user.id, idempotency_key, action)
        .await?;
    Ok(Json(result))
}
