//! Agent records and agent process control

use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::error::AppError;
use super::{AppState, optional_json};
use crate::model::{Agent, AgentStatus, NewEvent, kind};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    #[serde(alias = "task_id", rename = "taskId")]
    pub task_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PauseRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InjectRequest {
    pub message: String,
    #[serde(default, alias = "injectedBy")]
    pub injected_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RedirectRequest {
    #[serde(alias = "task_id", rename = "taskId")]
    pub task_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdateAgentRequest {
    pub status: Option<String>,
    #[serde(alias = "workingOn")]
    pub working_on: Option<String>,
    pub blocker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EnableRequest {
    #[serde(alias = "interval_ms", rename = "intervalMs")]
    pub interval_ms: Option<u64>,
}

/// Build the agents router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents))
        .route("/running", get(running_agents))
        .route("/orchestration/status", get(orchestration_status))
        .route("/orchestration/enable", post(enable_orchestration))
        .route("/orchestration/disable", post(disable_orchestration))
        .route("/orchestration/run", post(run_orchestration))
        .route("/:name", get(get_agent).patch(update_agent))
        .route("/:name/heartbeat", post(heartbeat))
        .route("/:name/sessions", get(list_sessions))
        .route("/:name/history", get(history))
        .route("/:name/start", post(start_agent))
        .route("/:name/stop", post(stop_agent))
        .route("/:name/pause", post(pause_agent))
        .route("/:name/resume", post(resume_agent))
        .route("/:name/inject", post(inject_message))
        .route("/:name/redirect", post(redirect_agent))
}

fn parse_agent_status(raw: &str) -> Result<AgentStatus, AppError> {
    raw.parse::<AgentStatus>()
        .map_err(|e| AppError::BadRequest(e.to_string()))
}

// ─── Records ───

async fn list_agents(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    Ok(Json(json!({ "agents": state.store().agents().list()? })))
}

async fn running_agents(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "running": state.manager.running_agents() }))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let agent = state.store().agents().require(&name)?;
    let controller_state = state.manager.controller_state(&name);
    let mut value = serde_json::to_value(agent)?;
    value["controllerState"] = json!(controller_state);
    Ok(Json(value))
}

/// Self-reported status from an agent or an operator. Fields left out keep
/// their current value.
async fn update_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<UpdateAgentRequest>, JsonRejection>,
) -> Result<Json<Agent>, AppError> {
    let Json(body) = payload?;
    let current = state.store().agents().require(&name)?;
    let status = match body.status.as_deref() {
        Some(raw) => parse_agent_status(raw)?,
        None => current.status,
    };
    let working_on = body.working_on.or(current.working_on);
    let blocker = body.blocker.or(current.blocker);
    let agent = state.store().agents().update_status(
        &name,
        status,
        working_on.as_deref(),
        blocker.as_deref(),
    )?;
    state.hub.publish_state()?;
    Ok(Json(agent))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let body: UpdateAgentRequest = optional_json(&body)?;
    let agents = state.store().agents();
    agents.heartbeat(&name)?;
    if body.status.is_some() || body.working_on.is_some() {
        let current = agents.require(&name)?;
        let status = match body.status.as_deref() {
            Some(raw) => parse_agent_status(raw)?,
            None => current.status,
        };
        let working_on = body.working_on.or(current.working_on);
        agents.update_status(&name, status, working_on.as_deref(), current.blocker.as_deref())?;
    }
    state.hub.record(NewEvent::new(kind::AGENT_HEARTBEAT).agent(&name))?;
    Ok(Json(json!({ "success": true })))
}

async fn list_sessions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.store().agents().require(&name)?;
    let sessions = state.store().sessions().list_for_agent(&name, Some(50))?;
    Ok(Json(json!({ "sessions": sessions })))
}

/// Messages of the agent's current session, or its latest one.
async fn history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let agent = state.store().agents().require(&name)?;
    let session_id = match agent.session_id {
        Some(id) => Some(id),
        None => state
            .store()
            .sessions()
            .list_for_agent(&name, Some(1))?
            .into_iter()
            .next()
            .map(|s| s.id),
    };
    let messages = match &session_id {
        Some(id) => state.store().messages().list_for_session(id, None)?,
        None => Vec::new(),
    };
    Ok(Json(json!({ "sessionId": session_id, "messages": messages })))
}

// ─── Process control ───

async fn start_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let body: StartRequest = optional_json(&body)?;
    let outcome = state
        .manager
        .start_agent(&name, body.task_id.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Agent {name} started"),
        "pid": outcome.pid,
        "sessionId": outcome.session_id,
    })))
}

async fn stop_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.manager.stop_agent(&name).await?;
    Ok(Json(json!({ "success": true, "message": format!("Agent {name} stopped") })))
}

async fn pause_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let body: PauseRequest = optional_json(&body)?;
    state.manager.pause_agent(&name, body.reason.as_deref())?;
    Ok(Json(json!({ "success": true, "message": format!("Agent {name} paused") })))
}

async fn resume_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.manager.resume_agent(&name)?;
    Ok(Json(json!({ "success": true, "message": format!("Agent {name} resumed") })))
}

async fn inject_message(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<InjectRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = payload?;
    if body.message.trim().is_empty() {
        return Err(AppError::BadRequest("message is required".to_string()));
    }
    let injected_by = body.injected_by.as_deref().unwrap_or("human");
    state
        .manager
        .inject_message(&name, &body.message, injected_by)
        .await?;
    Ok(Json(json!({ "success": true, "message": format!("Message injected into {name}") })))
}

async fn redirect_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<RedirectRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = payload?;
    state.manager.redirect_agent(&name, &body.task_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Agent {name} redirected to task {}", body.task_id),
    })))
}

// ─── Orchestration ───

async fn orchestration_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.manager.orchestration_status()))
}

async fn enable_orchestration(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let body: EnableRequest = optional_json(&body)?;
    let interval = match body.interval_ms {
        Some(0) => return Err(AppError::BadRequest("intervalMs must be positive".to_string())),
        Some(ms) => Some(Duration::from_millis(ms)),
        None => None,
    };
    let status = state.manager.enable_auto_orchestration(interval);
    Ok(Json(json!({
        "success": true,
        "message": "Auto-orchestration enabled",
        "enabled": status.enabled,
        "intervalMs": status.interval_ms,
    })))
}

async fn disable_orchestration(State(state): State<AppState>) -> Json<Value> {
    let status = state.manager.disable_auto_orchestration();
    Json(json!({
        "success": true,
        "message": "Auto-orchestration disabled",
        "enabled": status.enabled,
        "intervalMs": status.interval_ms,
    }))
}

async fn run_orchestration(State(state): State<AppState>) -> Json<Value> {
    let report = state.manager.run_cycle().await;
    Json(json!({ "success": true, "started": report.started, "errors": report.errors }))
}
