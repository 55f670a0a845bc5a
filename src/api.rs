//! HTTP facade over the supervisor.
//!
//! Every response is a JSON object with a `success` flag. Failures carry
//! `error` (a short category) and `message` (the detail).

use crate::error::SupervisorError;
use crate::job::{JobSnapshot, JobStatus};
use crate::supervisor::{BatchSupervisor, CsvUpload, StopOutcome};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

const DEFAULT_LOG_LINES: usize = 100;
const DEFAULT_CLEANUP_DAYS: u64 = 7;

type AppState = Arc<BatchSupervisor>;

/// The batch routes, to be nested under a prefix by the caller.
pub fn router(supervisor: Arc<BatchSupervisor>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/start", post(start_job))
        .route("/status/:job_id", get(job_status))
        .route("/list", get(list_jobs))
        .route("/stop/:job_id", post(stop_job))
        .route("/logs/:job_id", get(job_logs))
        .route("/cleanup", delete(cleanup_jobs))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(supervisor)
}

/// The full application: health check plus the batch routes under `/api/batch`.
pub fn app(supervisor: Arc<BatchSupervisor>, max_upload_bytes: usize) -> Router {
    let health_state = supervisor.clone();
    Router::new()
        .route("/health", get(health))
        .with_state(health_state)
        .nest("/api/batch", router(supervisor, max_upload_bytes))
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "Validation failed",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "Internal error",
            message: message.into(),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let (status, error) = match &err {
            SupervisorError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation failed"),
            SupervisorError::NotFound(_) => (StatusCode::NOT_FOUND, "Job not found"),
            SupervisorError::Spawn { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to start batch job")
            }
            SupervisorError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Storage error"),
        };
        if status.is_server_error() {
            error!(error = %err, "Batch request failed");
        }
        let message = match err {
            SupervisorError::Validation(message) => message,
            other => other.to_string(),
        };
        Self {
            status,
            error,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.error.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Runs a supervisor operation on the blocking pool. Start, list and cleanup
/// touch the jobs directory with synchronous filesystem calls.
async fn run_blocking<T, F>(supervisor: AppState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(AppState) -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || op(supervisor))
        .await
        .map_err(|e| {
            error!(error = %e, "Blocking supervisor task failed");
            ApiError::internal(format!("Supervisor task failed: {}", e))
        })
}

// ─── Responses ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartConfig {
    batch_size: u32,
    tab_delay: f64,
    batch_delay: f64,
    tags: Vec<String>,
    total_urls: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    success: bool,
    job_id: String,
    message: String,
    config: StartConfig,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    success: bool,
    job: JobSnapshot,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    success: bool,
    count: usize,
    jobs: Vec<JobSnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopResponse {
    success: bool,
    job_id: String,
    status: JobStatus,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogsResponse {
    success: bool,
    job_id: String,
    logs: Vec<String>,
    total_lines: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CleanupResponse {
    success: bool,
    deleted_count: usize,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    success: bool,
    status: &'static str,
    active_jobs: usize,
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health(State(supervisor): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        success: true,
        status: "ok",
        active_jobs: supervisor.registry().active_count(),
    })
}

async fn start_job(
    State(supervisor): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<StartResponse> {
    let mut multipart =
        multipart.map_err(|e| ApiError::bad_request(format!("Expected a multipart upload: {}", e)))?;

    let mut upload = CsvUpload::default();
    let mut has_file = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);

        if file_name.is_some() || name == "csvFile" {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?;
            upload.filename = file_name;
            upload.content = bytes.to_vec();
            has_file = true;
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid field '{}': {}", name, e)))?;
        match name.as_str() {
            "batchSize" => upload.batch_size = Some(value),
            "tabDelay" => upload.tab_delay = Some(value),
            "batchDelay" => upload.batch_delay = Some(value),
            "tags" => upload.tags = Some(value),
            other => warn!(field = %other, "Ignoring unknown form field"),
        }
    }

    if !has_file {
        return Err(ApiError::bad_request("No CSV file uploaded"));
    }

    let started = run_blocking(supervisor, move |s| s.start(upload)).await??;
    Ok(Json(StartResponse {
        success: true,
        message: format!("Batch job started with {} URLs", started.total_urls),
        job_id: started.job_id,
        config: StartConfig {
            batch_size: started.config.batch_size,
            tab_delay: started.config.tab_delay,
            batch_delay: started.config.batch_delay,
            tags: started.config.tags,
            total_urls: started.total_urls,
        },
    }))
}

async fn job_status(
    State(supervisor): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<StatusResponse> {
    let job = supervisor.status(&job_id)?;
    Ok(Json(StatusResponse { success: true, job }))
}

async fn list_jobs(State(supervisor): State<AppState>) -> ApiResult<ListResponse> {
    let jobs = run_blocking(supervisor, |s| s.list()).await?;
    Ok(Json(ListResponse {
        success: true,
        count: jobs.len(),
        jobs,
    }))
}

async fn stop_job(
    State(supervisor): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<StopResponse> {
    let (status, message) = match supervisor.stop(&job_id)? {
        StopOutcome::Stopped(snapshot) => (snapshot.status, "Batch job stopped".to_string()),
        StopOutcome::NotRunning { status } if status.is_terminal() => {
            (status, format!("Job already {}", status))
        }
        StopOutcome::NotRunning { status } => (
            status,
            format!(
                "Job is not tracked by this process (last recorded status: {})",
                status
            ),
        ),
    };
    Ok(Json(StopResponse {
        success: true,
        job_id,
        status,
        message,
    }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<String>,
}

async fn job_logs(
    State(supervisor): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<LogsResponse> {
    let lines = query
        .lines
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_LOG_LINES);
    let tail = supervisor.logs(&job_id, lines)?;
    Ok(Json(LogsResponse {
        success: true,
        job_id,
        logs: tail.lines,
        total_lines: tail.total_lines,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupQuery {
    older_than_days: Option<String>,
}

async fn cleanup_jobs(
    State(supervisor): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<CleanupResponse> {
    let days = match query.older_than_days.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_CLEANUP_DAYS,
        Some(raw) => raw.parse().map_err(|_| {
            ApiError::bad_request(format!(
                "olderThanDays must be a non-negative integer, got '{}'",
                raw
            ))
        })?,
    };

    let deleted = run_blocking(supervisor, move |s| s.cleanup(days)).await??;
    Ok(Json(CleanupResponse {
        success: true,
        deleted_count: deleted,
        message: format!("Deleted {} job(s) older than {} day(s)", deleted, days),
    }))
}
