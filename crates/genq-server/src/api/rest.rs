use super::{ApiError, AppState};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use genq_core::{GenerationParams, ParamOverrides, QueueMessage, Task, TaskStatus, TaskUpdate};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default, alias = "task_id")]
    pub task_id: Option<String>,
    #[serde(default, alias = "owner_identity", alias = "email")]
    pub owner_identity: String,
    #[serde(flatten)]
    pub params: GenerationParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    #[serde(alias = "task_id")]
    pub task_id: String,
    #[serde(default, alias = "owner_identity", alias = "email")]
    pub owner_identity: String,
    #[serde(flatten)]
    pub overrides: ParamOverrides,
}

fn accepted(data: Value) -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "success": true, "data": data }))).into_response()
}

fn parse<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn require_owner(owner: &str) -> Result<(), ApiError> {
    if owner.trim().is_empty() {
        return Err(ApiError::BadRequest("ownerIdentity is required".to_string()));
    }
    Ok(())
}

/// Mark queued, publish, and roll the task to `failed` if the broker refuses.
/// `reopened` marks a manual retry so workers may restart a finished task.
async fn enqueue(state: &AppState, task: &Task, reopened: bool) -> Result<Task, ApiError> {
    let task = state
        .store
        .transition(&task.task_id, TaskStatus::Queued, TaskUpdate::default())?;
    let queue = &state.broker.config().generation_queue;
    let mut message = QueueMessage::from_task(&task);
    if reopened {
        message = message.reopened();
    }
    if let Err(e) = state.broker.publish(queue, &message).await {
        error!(task_id = %task.task_id, error = %e, "Failed to publish task");
        let reason = format!("Failed to enqueue task: {}", e);
        if let Err(e) = state
            .store
            .transition(&task.task_id, TaskStatus::Failed, TaskUpdate::error(reason))
        {
            error!(task_id = %task.task_id, error = %e, "Failed to mark task failed");
        }
        return Err(ApiError::Unavailable("Task queue is unavailable".to_string()));
    }
    Ok(task)
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    submit_inner(&state, body).await.map_err(|e| state.reject(e))
}

async fn submit_inner(
    state: &AppState,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let req = parse(body)?;
    require_owner(&req.owner_identity)?;
    req.params.validate()?;
    if let Some(id) = &req.task_id {
        if id.trim().is_empty() {
            return Err(ApiError::BadRequest("taskId must not be empty".to_string()));
        }
        if state.store.get(id)?.is_some() {
            return Err(ApiError::Conflict(format!("Task {} already exists", id)));
        }
    }

    if !state.billing.has_sufficient_balance(&req.owner_identity).await {
        return Err(ApiError::InsufficientBalance);
    }

    let task = state
        .store
        .create(req.task_id, req.params, &req.owner_identity)?;
    let task = enqueue(state, &task, false).await?;

    info!(task_id = %task.task_id, "Task submitted");
    Ok(accepted(json!({ "taskId": task.task_id, "status": "started" })))
}

pub async fn retry(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RetryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    retry_inner(&state, body).await.map_err(|e| state.reject(e))
}

async fn retry_inner(
    state: &AppState,
    body: Result<Json<RetryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let req = parse(body)?;
    require_owner(&req.owner_identity)?;

    let task = state
        .store
        .get(&req.task_id)?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", req.task_id)))?;
    if task.owner_identity != req.owner_identity {
        return Err(ApiError::Forbidden("Task belongs to another owner".to_string()));
    }
    if !matches!(task.status, TaskStatus::Failed | TaskStatus::DeadLettered) {
        return Err(ApiError::Conflict(format!(
            "Task is {} and cannot be retried",
            task.status
        )));
    }

    if !state.billing.has_sufficient_balance(&req.owner_identity).await {
        return Err(ApiError::InsufficientBalance);
    }

    let task = state.store.reopen(&req.task_id, &req.overrides)?;
    let task = enqueue(state, &task, true).await?;

    info!(task_id = %task.task_id, retry_count = task.retry_count, "Task retry submitted");
    Ok(accepted(json!({
        "taskId": task.task_id,
        "status": "started",
        "retryCount": task.retry_count,
    })))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .store
        .get_safe(&task_id)
        .map_err(|e| state.reject(e.into()))?
        .ok_or_else(|| state.reject(ApiError::NotFound(format!("Task {} not found", task_id))))?;
    Ok(Json(json!({ "success": true, "data": task })))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "status": "ok",
            "brokerConnected": state.broker.is_connected(),
            "eventClients": state.notifier.client_count(),
        }
    }))
}

pub async fn system(State(state): State<Arc<AppState>>) -> Json<Value> {
    use sysinfo::{Pid, System};

    let pid = std::process::id();
    let sys = System::new_all();
    let memory_bytes = sys.process(Pid::from_u32(pid)).map_or(0, |p| p.memory());
    let load = System::load_average();
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    Json(json!({
        "success": true,
        "data": {
            "pid": pid,
            "hostname": hostname,
            "uptimeSecs": state.started_at.elapsed().as_secs(),
            "memoryBytes": memory_bytes,
            "totalMemoryBytes": sys.total_memory(),
            "loadAverage": [load.one, load.five, load.fifteen],
            "cpus": sys.cpus().len(),
        }
    }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    state
        .metrics
        .sse_clients
        .set(state.notifier.client_count() as i64);
    state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))
}
