//! HTTP surface for queue processes.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`), which ping the broker
//! - Queue depths (`/stats`) and task lookup (`/tasks/{id}`)
//! - Prometheus metrics (`/metrics`)
//! - Dead letter admin endpoints (`/admin/dlq/*`)

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueueError;
use crate::manager::QueueManager;
use crate::metrics;
use crate::task::TaskId;

type ApiError = (StatusCode, Json<Value>);

/// Shared state for the queue endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub manager: Arc<QueueManager>,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        manager: Arc<QueueManager>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

fn error_response(e: QueueError) -> ApiError {
    let status = match &e {
        QueueError::NotFound(_) => StatusCode::NOT_FOUND,
        QueueError::NotDeadLettered { .. } | QueueError::Duplicate(_) => StatusCode::CONFLICT,
        _ if e.is_connection_error() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

/// Liveness probe handler. Always OK while the process serves requests.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler; 503 when the broker does not answer.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    match state.manager.ping().await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": {
                    "broker": "ok"
                }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {
                    "broker": format!("error: {}", e)
                }
            })),
        )),
    }
}

/// Queue depths per state.
///
/// `GET /stats`
pub async fn stats_handler(
    State(state): State<HealthState>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.stats().await.map(Json).map_err(error_response)
}

/// Current record of one task.
///
/// `GET /tasks/{id}`
pub async fn task_status_handler(
    State(state): State<HealthState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = TaskId::new(task_id);
    match state.manager.get_status(&task_id).await {
        Ok(Some(task)) => Ok(Json(task)),
        Ok(None) => Err(error_response(QueueError::NotFound(task_id))),
        Err(e) => Err(error_response(e)),
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Query parameters for the dead letter list endpoint.
#[derive(Debug, Deserialize)]
pub struct DlqListParams {
    /// Maximum number of entries to return (default: 10, max: 100)
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    10
}

/// Query parameters for the cleanup endpoint.
#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    /// Age threshold in hours (default: 24)
    #[serde(default = "default_older_than_hours")]
    pub older_than_hours: u64,
}

fn default_older_than_hours() -> u64 {
    24
}

/// List dead letter entries, oldest first.
///
/// `GET /admin/dlq/messages?limit=10&offset=0`
pub async fn dlq_list_handler(
    State(state): State<HealthState>,
    Query(params): Query<DlqListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.min(100);
    let entries = state
        .manager
        .dead_letters(limit, params.offset)
        .await
        .map_err(error_response)?;

    Ok(Json(json!({
        "count": entries.len(),
        "limit": limit,
        "offset": params.offset,
        "entries": entries,
    })))
}

/// Move a dead-lettered task back to `pending`.
///
/// `POST /admin/dlq/retry/{id}`
pub async fn dlq_retry_handler(
    State(state): State<HealthState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .manager
        .retry(&TaskId::new(task_id))
        .await
        .map_err(error_response)?;

    Ok(Json(json!({
        "success": true,
        "task_id": task.task_id,
        "status": task.status,
        "message": "Task requeued for processing"
    })))
}

/// Drop terminal records older than the threshold.
///
/// `POST /admin/cleanup?older_than_hours=24`
pub async fn cleanup_handler(
    State(state): State<HealthState>,
    Query(params): Query<CleanupParams>,
) -> Result<impl IntoResponse, ApiError> {
    let older_than = Duration::from_secs(params.older_than_hours.saturating_mul(3600));
    state
        .manager
        .cleanup(older_than)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Probe and monitoring routes.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stats", get(stats_handler))
        .route("/tasks/{id}", get(task_status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Dead letter and maintenance routes.
pub fn admin_router(state: HealthState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/admin/dlq/messages", get(dlq_list_handler))
        .route("/admin/dlq/retry/{id}", post(dlq_retry_handler))
        .route("/admin/cleanup", post(cleanup_handler))
        .with_state(state)
}

/// Health and admin routes together.
pub fn full_admin_router(state: HealthState) -> axum::Router {
    health_router(state.clone()).merge(admin_router(state))
}
