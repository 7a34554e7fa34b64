use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use vizflow_common::{Patch, TraceRecord};

use crate::errors::{EditError, PatchError, StoreError, TaskError};
use crate::patch::{ChartEdit, ChartState};
use crate::pipeline::PipelineConfig;
use crate::runner::{TaskRunner, TaskSnapshot};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    /// Also owns the chart editor, see [`TaskRunner::editor`].
    pub runner: TaskRunner,
    /// Applied when a submission leaves `sample_limit` out.
    pub default_sample_limit: usize,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(default)]
    pub dataset_version: Option<String>,
    pub dataset_path: std::path::PathBuf,
    #[serde(default)]
    pub sample_limit: Option<usize>,
    pub user_goal: String,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
}

#[derive(Deserialize)]
pub struct ReplayRequest {
    pub task_id: String,
}

#[derive(Serialize)]
pub struct ReplayResponse {
    pub task_id: String,
    pub spans: usize,
    pub trace: TraceRecord,
}

#[derive(Deserialize)]
pub struct ReplaceRequest {
    pub task_id: String,
    pub state: ChartState,
    pub patch: Patch,
    #[serde(default)]
    pub expected_hash: Option<String>,
}

#[derive(Deserialize)]
pub struct RevertRequest {
    pub task_id: String,
    pub state: ChartState,
    pub steps: usize,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            TaskError::Duplicate { .. } => ApiError::Conflict(err.to_string()),
            TaskError::InvalidId { .. } => ApiError::BadRequest(err.to_string()),
            TaskError::Store(e) => e.into(),
            TaskError::RunnerClosed => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::InvalidKey { .. } => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<EditError> for ApiError {
    fn from(err: EditError) -> Self {
        match err {
            EditError::Patch(PatchError::StaleState { .. }) => ApiError::Conflict(err.to_string()),
            EditError::Patch(e) => ApiError::BadRequest(e.to_string()),
            EditError::Store(e) => e.into(),
            EditError::Trace(e) => ApiError::Internal(e.to_string()),
        }
    }
}

/// Run store-backed work on the blocking pool. Trace reads and chart edits
/// can touch the trace directory.
async fn blocking<T, E, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("Store task panicked: {}", e)))?
        .map_err(Into::into)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/task/submit", post(submit_task))
        .route("/api/task/{id}/result", get(task_result))
        .route("/api/task/{id}/stream", get(task_stream))
        .route("/api/trace/{id}", get(get_trace))
        .route("/api/trace/replay", post(replay_trace))
        .route("/api/chart/replace", post(replace_chart))
        .route("/api/chart/revert", post(revert_chart))
}

async fn health() -> &'static str {
    "ok"
}

async fn submit_task(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.user_goal.trim().is_empty() {
        return Err(ApiError::BadRequest("user_goal must not be empty".into()));
    }
    if !req.dataset_path.is_file() {
        return Err(ApiError::BadRequest(format!(
            "Dataset {} does not exist",
            req.dataset_path.display()
        )));
    }

    let mut config = PipelineConfig::new(&req.dataset_path, req.user_goal)
        .with_sample_limit(req.sample_limit.unwrap_or(state.default_sample_limit));
    config.task_id = req.task_id;
    if let Some(id) = req.dataset_id {
        config.dataset_name = id.clone();
        config.dataset_id = id;
    }
    if let Some(name) = req.dataset_name {
        config.dataset_name = name;
    }
    if let Some(version) = req.dataset_version {
        config.dataset_version = version;
    }

    let task_id = state.runner.submit(config).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_id })))
}

async fn task_result(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    Ok(Json(state.runner.snapshot(&id).await?))
}

/// `data:` frame per event, then a final `end` event.
async fn task_stream(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let events = state.runner.subscribe(&id).await?;
    let frames = stream::unfold(Some(events), |events| async move {
        let mut events = events?;
        match events.next().await {
            Some(event) => Some((Event::default().json_data(&event), Some(events))),
            None => Some((Ok(Event::default().event("end").data("end")), None)),
        }
    });
    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

async fn get_trace(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<TraceRecord>, ApiError> {
    let runner = state.runner.clone();
    Ok(Json(blocking(move || runner.trace(&id)).await?))
}

async fn replay_trace(
    State(state): State<SharedState>,
    Json(req): Json<ReplayRequest>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let runner = state.runner.clone();
    let task_id = req.task_id.clone();
    let trace = blocking(move || runner.trace(&task_id)).await?;
    trace.validate().map_err(ApiError::Internal)?;
    Ok(Json(ReplayResponse {
        task_id: req.task_id,
        spans: trace.spans.len(),
        trace,
    }))
}

async fn replace_chart(
    State(state): State<SharedState>,
    Json(req): Json<ReplaceRequest>,
) -> Result<Json<ChartEdit>, ApiError> {
    let editor = state.runner.editor().clone();
    let edit = blocking(move || {
        editor.apply(
            &req.task_id,
            &req.state,
            req.patch,
            req.expected_hash.as_deref(),
        )
    })
    .await?;
    Ok(Json(edit))
}

async fn revert_chart(
    State(state): State<SharedState>,
    Json(req): Json<RevertRequest>,
) -> Result<Json<ChartEdit>, ApiError> {
    let editor = state.runner.editor().clone();
    let edit = blocking(move || editor.revert(&req.task_id, &req.state, req.steps)).await?;
    Ok(Json(edit))
}
