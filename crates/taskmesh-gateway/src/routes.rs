use crate::control::ControlPlane;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::protocol::{
    Ack, CancelTaskRequest, CancelTaskResponse, DiscoverRequest, FindAllRequest,
    HeartbeatResponse, PollRequest, PollResponse, RegisterWorkerRequest, RegisterWorkerResponse,
    SubmitBatchRequest, SubmitBatchResponse, SubmitTaskResponse, WorkerIdRequest,
};
use taskmesh_core::{Task, TaskProgress, TaskResult, TaskStatus};
use taskmesh_orchestrator::{MasterStatus, PoolStats, QueueStats, RunSummary};
use taskmesh_registry::{DiscoveryStrategy, RegistryConfig, RegistryStatistics, WorkerInfo};

/// Shared state of every handler.
pub type AppState = Arc<ControlPlane>;

// --- General ---

/// `GET /health`
pub async fn health(State(plane): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "taskmesh",
        "running": plane.master().is_running(),
    }))
}

/// `GET /status`
pub async fn status(State(plane): State<AppState>) -> Json<MasterStatus> {
    Json(plane.master().get_status().await)
}

/// `GET /workers/stats`
pub async fn worker_stats(State(plane): State<AppState>) -> Json<PoolStats> {
    Json(plane.master().get_worker_pool_stats())
}

// --- Registry ---

/// `POST /registry/workers/register`
pub async fn register_worker(
    State(plane): State<AppState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> ApiResult<Json<RegisterWorkerResponse>> {
    Ok(Json(plane.register_worker(request).await?))
}

/// `POST /registry/workers/unregister`
pub async fn unregister_worker(
    State(plane): State<AppState>,
    Json(request): Json<WorkerIdRequest>,
) -> Json<Ack> {
    Json(plane.unregister_worker(&request.worker_id).await)
}

/// `POST /registry/workers/heartbeat`
pub async fn heartbeat(
    State(plane): State<AppState>,
    Json(request): Json<WorkerIdRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    Ok(Json(plane.heartbeat(&request.worker_id).await?))
}

/// Filter for the worker listing.
#[derive(Debug, Deserialize, Default)]
pub struct ListWorkersQuery {
    /// Only workers whose heartbeat is fresh.
    #[serde(default)]
    pub healthy_only: bool,
}

/// `GET /registry/workers`
pub async fn list_workers(
    State(plane): State<AppState>,
    Query(query): Query<ListWorkersQuery>,
) -> Json<Value> {
    let registry = plane.registry();
    let workers = if query.healthy_only {
        registry.get_healthy_workers().await
    } else {
        registry.all_workers().await
    };
    Json(json!({ "count": workers.len(), "workers": workers }))
}

/// `GET /registry/workers/{worker_id}`
pub async fn get_worker(
    State(plane): State<AppState>,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<WorkerInfo>> {
    plane
        .registry()
        .get_worker(&worker_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Worker not found: {worker_id}")))
}

/// `POST /registry/discover`
pub async fn discover(
    State(plane): State<AppState>,
    Json(request): Json<DiscoverRequest>,
) -> Json<Value> {
    let workers = plane
        .registry()
        .discover_workers(&request.capability, request.healthy_only)
        .await;
    Json(json!({ "count": workers.len(), "workers": workers }))
}

/// `GET /registry/stats`
pub async fn registry_stats(State(plane): State<AppState>) -> Json<RegistryStatistics> {
    Json(plane.registry().statistics().await)
}

/// `GET /registry/config`
pub async fn registry_config(State(plane): State<AppState>) -> Json<RegistryConfig> {
    Json(plane.registry().config().clone())
}

// --- Service discovery ---

/// Capability lookup parameters.
#[derive(Debug, Deserialize)]
pub struct FindQuery {
    /// Task type to match.
    pub capability: String,
    /// Balancing strategy name. Defaults to least loaded.
    #[serde(default)]
    pub strategy: Option<String>,
}

/// `GET /service-discovery/find`
pub async fn find_worker(State(plane): State<AppState>, Query(query): Query<FindQuery>) -> Json<Value> {
    let strategy = query
        .strategy
        .as_deref()
        .map(DiscoveryStrategy::from_name)
        .unwrap_or_default();
    match plane
        .discovery()
        .find_by_capability(&query.capability, strategy)
        .await
    {
        Some(worker) => Json(json!({ "success": true, "worker": worker })),
        None => Json(json!({
            "success": false,
            "message": format!("No worker found with capability: {}", query.capability),
        })),
    }
}

/// `POST /service-discovery/find-all`
pub async fn find_all(
    State(plane): State<AppState>,
    Json(request): Json<FindAllRequest>,
) -> Json<Value> {
    let workers = plane
        .discovery()
        .find_all_by_capabilities(&request.capabilities, request.require_all)
        .await;
    Json(json!({ "count": workers.len(), "workers": workers }))
}

// --- Tasks ---

/// `POST /tasks/submit`
pub async fn submit_task(
    State(plane): State<AppState>,
    Json(task): Json<Task>,
) -> ApiResult<Json<SubmitTaskResponse>> {
    Ok(Json(plane.submit_task(task).await?))
}

/// `POST /tasks/submit/batch`
pub async fn submit_batch(
    State(plane): State<AppState>,
    Json(request): Json<SubmitBatchRequest>,
) -> ApiResult<Json<SubmitBatchResponse>> {
    Ok(Json(plane.submit_batch(request.tasks).await?))
}

/// `POST /tasks/cancel`
pub async fn cancel_task(
    State(plane): State<AppState>,
    Json(request): Json<CancelTaskRequest>,
) -> Json<CancelTaskResponse> {
    Json(plane.cancel_task(&request.task_id).await)
}

/// `GET /tasks/result/{task_id}`
pub async fn get_result(
    State(plane): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResult>> {
    plane
        .master()
        .get_task_result(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No result for task: {task_id}")))
}

/// `GET /tasks/results`
pub async fn all_results(State(plane): State<AppState>) -> Json<Value> {
    let results = plane.master().get_all_results();
    Json(json!({ "count": results.len(), "results": results }))
}

/// `DELETE /tasks/results`
pub async fn clear_results(State(plane): State<AppState>) -> Json<Value> {
    let cleared = plane.master().clear_results();
    Json(json!({
        "success": true,
        "cleared": cleared,
        "message": format!("Cleared {cleared} results"),
    }))
}

// --- Queue ---

/// `GET /queue/stats`
pub async fn queue_stats(State(plane): State<AppState>) -> Json<QueueStats> {
    Json(plane.master().queue_stats().await)
}

/// Filters for the queue listing.
#[derive(Debug, Deserialize, Default)]
pub struct QueueTasksQuery {
    /// Task status name.
    pub status: Option<String>,
    /// Exact task type.
    pub task_type: Option<String>,
}

/// `GET /queue/tasks`
pub async fn queue_tasks(
    State(plane): State<AppState>,
    Query(query): Query<QueueTasksQuery>,
) -> ApiResult<Json<Value>> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<TaskStatus>()
                .map_err(|_| ApiError::BadRequest(format!("Invalid task status: {s}")))?,
        ),
        None => None,
    };
    let tasks = plane
        .master()
        .pending_tasks(status, query.task_type.as_deref())
        .await;
    Ok(Json(json!({ "count": tasks.len(), "tasks": tasks })))
}

/// Parameters of a blocking run.
#[derive(Debug, Deserialize)]
pub struct ExecuteQuery {
    /// Seconds.
    #[serde(default = "default_execute_timeout")]
    pub timeout: f64,
}

fn default_execute_timeout() -> f64 {
    60.0
}

/// `POST /execute`
pub async fn execute(
    State(plane): State<AppState>,
    Query(query): Query<ExecuteQuery>,
) -> ApiResult<Json<RunSummary>> {
    let timeout = Duration::try_from_secs_f64(query.timeout)
        .map_err(|_| ApiError::BadRequest(format!("Invalid timeout: {}", query.timeout)))?;
    Ok(Json(plane.master().run(timeout).await))
}

// --- Remote agent side ---

/// `POST /tasks/poll`
pub async fn poll(
    State(plane): State<AppState>,
    Json(request): Json<PollRequest>,
) -> ApiResult<Json<PollResponse>> {
    Ok(Json(plane.poll(&request).await?))
}

/// `POST /tasks/progress`
pub async fn progress(
    State(plane): State<AppState>,
    Json(progress): Json<TaskProgress>,
) -> Json<Ack> {
    Json(plane.report_progress(&progress))
}

/// `POST /tasks/report`
pub async fn report(State(plane): State<AppState>, Json(result): Json<TaskResult>) -> Json<Ack> {
    Json(plane.report_result(result))
}
