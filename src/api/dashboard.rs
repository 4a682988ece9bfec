//! Aggregated views for the dashboard

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use super::error::AppError;
use crate::broadcast::DashboardState;
use crate::model::{TaskFilter, TaskStatus};

const ACTIVITY_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<usize>,
}

/// Build the dashboard router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/summary", get(summary))
        .route("/board", get(board))
        .route("/state", get(state_snapshot))
        .route("/workload", get(workload))
        .route("/activity", get(activity))
}

/// Task counts by stage and agent counts by status
async fn summary(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let tasks = state.store().tasks().counts(Utc::now() - Duration::hours(24))?;
    let agents = state.store().agents().counts()?;
    let in_status = |status: TaskStatus| tasks.by_status.get(&status).copied().unwrap_or(0);
    Ok(Json(json!({
        "tasks": {
            "total": tasks.total,
            "inbox": in_status(TaskStatus::Inbox),
            "ready": in_status(TaskStatus::Ready),
            "in_progress": in_status(TaskStatus::InProgress),
            "done": in_status(TaskStatus::Done),
            "qa_testing": in_status(TaskStatus::QaTesting),
            "qa_passed": in_status(TaskStatus::QaPassed),
            "qa_failed": in_status(TaskStatus::QaFailed),
            "reviewing": in_status(TaskStatus::Reviewing),
            "reviewed": in_status(TaskStatus::Reviewed),
            "shipped_today": tasks.shipped_today,
        },
        "agents": {
            "total": agents.total,
            "online": agents.online,
            "working": agents.working,
            "idle": agents.idle,
            "paused": agents.paused,
            "blocked": agents.blocked,
        },
        "running": state.manager.running_agents().len(),
        "orchestration": state.manager.orchestration_status(),
    })))
}

/// One column per workflow status, in workflow order
async fn board(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let mut columns = Vec::with_capacity(TaskStatus::ALL.len());
    for status in TaskStatus::ALL {
        let tasks = state.store().tasks().list(&TaskFilter::status(status))?;
        columns.push(json!({ "status": status, "tasks": tasks }));
    }
    Ok(Json(json!({ "columns": columns })))
}

async fn state_snapshot(State(state): State<AppState>) -> Result<Json<DashboardState>, AppError> {
    Ok(Json(state.hub.snapshot()?))
}

async fn workload(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    Ok(Json(json!({ "agents": state.store().agents().workload()? })))
}

async fn activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Value>, AppError> {
    let limit = query.limit.unwrap_or(ACTIVITY_LIMIT);
    let events = state.store().events().list(None, None, Some(limit))?;
    Ok(Json(json!({ "events": events })))
}
