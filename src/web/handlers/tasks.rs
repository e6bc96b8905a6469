use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::schedule::error::TaskError;
use crate::schedule::scheduler::TaskManager;
use crate::schedule::types::{TaskQuery, TaskStatus};
use crate::web::Pagination;

const DEFAULT_CLEANUP_DAYS: u32 = 30;

pub fn tasks_router(task_manager: Arc<TaskManager>) -> Router {
    Router::new()
        .route("/process", post(process_video))
        .route("/status/:task_id", get(get_status))
        .route("/result/:task_id", get(get_result))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", delete(delete_task))
        .route("/tasks/:task_id/events", get(get_events))
        .route("/cleanup", post(cleanup))
        .route("/stats", get(get_stats))
        .with_state(task_manager)
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

fn status_code(e: &TaskError) -> StatusCode {
    match e {
        TaskError::InvalidInput(_) | TaskError::NotReady { .. } => StatusCode::BAD_REQUEST,
        TaskError::NotFound(_) => StatusCode::NOT_FOUND,
        TaskError::Conflict(_) => StatusCode::CONFLICT,
        TaskError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        TaskError::InvalidTransition { .. }
        | TaskError::InvalidProgress(_)
        | TaskError::Store(_)
        | TaskError::Corrupt(_)
        | TaskError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(action: &str, e: TaskError) -> Response {
    let status = status_code(&e);
    if status.is_server_error() {
        error!("Failed to {}: {}", action, e);
    }
    (status, Json(ApiResponse::<()>::error(e.to_string()))).into_response()
}

fn respond<T: Serialize>(action: &str, status: StatusCode, result: Result<T, TaskError>) -> Response {
    match result {
        Ok(data) => (status, Json(ApiResponse::success(data))).into_response(),
        Err(e) => error_response(action, e),
    }
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    task_id: String,
    status: TaskStatus,
}

// Submit a video for processing
async fn process_video(
    State(task_manager): State<Arc<TaskManager>>,
    Json(req): Json<ProcessRequest>,
) -> Response {
    let result = task_manager.submit(&req.url).await.map(|task_id| ProcessResponse {
        task_id,
        status: TaskStatus::Queued,
    });
    respond("submit task", StatusCode::ACCEPTED, result)
}

async fn get_status(
    State(task_manager): State<Arc<TaskManager>>,
    Path(task_id): Path<String>,
) -> Response {
    respond("get task status", StatusCode::OK, task_manager.get_status(&task_id).await)
}

// Rendered summary document
async fn get_result(
    State(task_manager): State<Arc<TaskManager>>,
    Path(task_id): Path<String>,
) -> Response {
    match task_manager.get_result(&task_id).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => error_response("get task result", e),
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    search: Option<String>,
    index: Option<u64>,
    size: Option<u64>,
}

impl ListParams {
    fn into_query(self) -> Result<TaskQuery, TaskError> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") | Some("all") => None,
            Some(status) => Some(status.parse::<TaskStatus>()?),
        };
        let pagination = Pagination::new(self.index, self.size);
        Ok(TaskQuery {
            status,
            search: self.search.filter(|s| !s.trim().is_empty()),
            limit: pagination.limit(),
            offset: pagination.offset(),
        })
    }
}

async fn list_tasks(
    State(task_manager): State<Arc<TaskManager>>,
    Query(params): Query<ListParams>,
) -> Response {
    let result = match params.into_query() {
        Ok(query) => task_manager.list(&query).await,
        Err(e) => Err(e),
    };
    respond("list tasks", StatusCode::OK, result)
}

async fn get_events(
    State(task_manager): State<Arc<TaskManager>>,
    Path(task_id): Path<String>,
) -> Response {
    respond("get task events", StatusCode::OK, task_manager.get_events(&task_id).await)
}

async fn delete_task(
    State(task_manager): State<Arc<TaskManager>>,
    Path(task_id): Path<String>,
) -> Response {
    let result = task_manager.delete(&task_id).await.map(|_| true);
    respond("delete task", StatusCode::OK, result)
}

#[derive(Debug, Deserialize)]
struct CleanupParams {
    days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    deleted_count: u64,
    days: u32,
}

async fn cleanup(
    State(task_manager): State<Arc<TaskManager>>,
    Query(params): Query<CleanupParams>,
) -> Response {
    let days = params.days.unwrap_or(DEFAULT_CLEANUP_DAYS);
    let result = task_manager
        .cleanup(days)
        .await
        .map(|deleted_count| CleanupResponse { deleted_count, days });
    respond("clean up tasks", StatusCode::OK, result)
}

async fn get_stats(State(task_manager): State<Arc<TaskManager>>) -> impl IntoResponse {
    respond("get task stats", StatusCode::OK, task_manager.get_stats().await)
}
