//! Task endpoints

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::error::AppError;
use super::{AppState, optional_json, split_list};
use crate::model::{NewEvent, NewTask, Task, TaskFilter, TaskStatus, TaskUpdate, kind};

/// Query params for listing tasks
#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    /// One status or a comma-separated list
    pub status: Option<String>,
    pub assigned_to: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CompleteRequest {
    pub summary: Option<String>,
    #[serde(alias = "filesChanged")]
    pub files_changed: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QaFailRequest {
    pub reason: Option<String>,
}

/// Build the tasks router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(create_task))
        .route("/:id", get(get_task).patch(update_task).delete(delete_task))
        .route("/:id/claim", post(claim_task))
        .route("/:id/complete", post(complete_task))
        .route("/:id/status", post(set_status))
        .route("/:id/qa-start", post(qa_start))
        .route("/:id/qa-pass", post(qa_pass))
        .route("/:id/qa-fail", post(qa_fail))
        .route("/:id/review-start", post(review_start))
        .route("/:id/review-pass", post(review_pass))
        .route("/:id/ship", post(ship))
}

fn parse_status(raw: &str) -> Result<TaskStatus, AppError> {
    raw.parse::<TaskStatus>()
        .map_err(|e| AppError::BadRequest(e.to_string()))
}

/// List tasks, by priority then insertion order
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Value>, AppError> {
    let statuses = split_list(query.status.as_deref())
        .into_iter()
        .map(parse_status)
        .collect::<Result<Vec<_>, _>>()?;
    let filter = TaskFilter {
        statuses,
        assigned_to: query.assigned_to,
        limit: query.limit,
        offset: query.offset,
    };
    let tasks = state.store().tasks().list(&filter)?;
    let total = state.store().tasks().count(&filter)?;
    Ok(Json(json!({ "tasks": tasks, "total": total })))
}

async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let Json(input) = payload?;
    let task = state.store().tasks().create(&input)?;
    state.hub.record(
        NewEvent::new(kind::TASK_CREATED)
            .task(Some(&task.id))
            .data(json!({ "title": task.title, "priority": task.priority, "status": task.status }))
            .message(format!("Task created: {}", task.title)),
    )?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.store().tasks().require(&id)?))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<TaskUpdate>, JsonRejection>,
) -> Result<Json<Task>, AppError> {
    let Json(update) = payload?;
    if update.is_empty() {
        return Err(AppError::BadRequest("No fields to update".to_string()));
    }
    let task = state.store().tasks().update(&id, &update)?;
    state.hub.record(
        NewEvent::new(kind::TASK_UPDATED)
            .task(Some(&task.id))
            .message(format!("Task updated: {}", task.title)),
    )?;
    Ok(Json(task))
}

/// Administrative delete; the orchestrator never removes tasks itself
async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if !state.store().tasks().delete(&id)? {
        return Err(AppError::NotFound(format!("task not found: {id}")));
    }
    state.hub.publish_state()?;
    Ok(Json(json!({ "success": true })))
}

async fn claim_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ClaimRequest>, JsonRejection>,
) -> Result<Json<Task>, AppError> {
    let Json(body) = payload?;
    let task = state.store().tasks().claim(&id, &body.agent)?;
    state.hub.record(
        NewEvent::new(kind::TASK_CLAIMED)
            .agent(&body.agent)
            .task(Some(&task.id))
            .message(format!("{} claimed \"{}\"", body.agent, task.title)),
    )?;
    Ok(Json(task))
}

async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Json<Task>, AppError> {
    let Json(body) = payload?;
    let task = state
        .store()
        .tasks()
        .complete(&id, body.summary.as_deref(), &body.files_changed)?;
    let mut event = NewEvent::new(kind::TASK_COMPLETED)
        .task(Some(&task.id))
        .data(json!({ "summary": task.summary, "filesChanged": task.files_changed }))
        .message(format!("Task completed: {}", task.title));
    if let Some(agent) = &task.assigned_to {
        event = event.agent(agent);
    }
    state.hub.record(event)?;
    Ok(Json(task))
}

/// Unchecked status change. Skips the workflow graph on purpose.
async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<Task>, AppError> {
    let Json(body) = payload?;
    let to = parse_status(&body.status)?;
    let from = state.store().tasks().require(&id)?.status;
    let task = state.store().tasks().set_status(&id, to)?;
    state.hub.record(
        NewEvent::new(kind::TASK_STATUS_CHANGED)
            .task(Some(&task.id))
            .data(json!({ "from": from, "to": to }))
            .message(format!("{}: {from} -> {to}", task.title)),
    )?;
    Ok(Json(task))
}

/// Apply a checked workflow move and record it.
fn checked_move(
    state: &AppState,
    id: &str,
    to: TaskStatus,
    event_kind: &str,
    data: Value,
) -> Result<Json<Task>, AppError> {
    let task = state.store().tasks().transition(id, to)?;
    state.hub.record(
        NewEvent::new(event_kind)
            .task(Some(&task.id))
            .data(data)
            .message(format!("{} is now {to}", task.title)),
    )?;
    Ok(Json(task))
}

async fn qa_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    checked_move(&state, &id, TaskStatus::QaTesting, kind::TASK_QA_STARTED, json!({}))
}

async fn qa_pass(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    checked_move(&state, &id, TaskStatus::QaPassed, kind::TASK_QA_PASSED, json!({}))
}

async fn qa_fail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Task>, AppError> {
    let reason = optional_json::<QaFailRequest>(&body)?.reason;
    checked_move(
        &state,
        &id,
        TaskStatus::QaFailed,
        kind::TASK_QA_FAILED,
        json!({ "reason": reason }),
    )
}

async fn review_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    checked_move(&state, &id, TaskStatus::Reviewing, kind::TASK_REVIEW_STARTED, json!({}))
}

async fn review_pass(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    checked_move(&state, &id, TaskStatus::Reviewed, kind::TASK_REVIEWED, json!({}))
}

async fn ship(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    checked_move(&state, &id, TaskStatus::Shipped, kind::TASK_SHIPPED, json!({}))
}
