//! Handoff endpoints

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use super::error::AppError;
use crate::model::{Handoff, HandoffFilter, HandoffStatus, NewEvent, NewHandoff, kind};

#[derive(Debug, Deserialize)]
pub struct ListHandoffsQuery {
    pub to_agent: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent: String,
}

/// Build the handoffs router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_handoffs).post(create_handoff))
        .route("/:id", get(get_handoff))
        .route("/:id/claim", post(claim_handoff))
        .route("/:id/resolve", post(resolve_handoff))
        .route("/:id/dismiss", post(dismiss_handoff))
}

async fn list_handoffs(
    State(state): State<AppState>,
    Query(query): Query<ListHandoffsQuery>,
) -> Result<Json<Value>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            raw.parse::<HandoffStatus>()
                .map_err(|e| AppError::BadRequest(e.to_string()))
        })
        .transpose()?;
    let handoffs = state.store().handoffs().list(&HandoffFilter {
        to_agent: query.to_agent,
        status,
        limit: query.limit,
    })?;
    Ok(Json(json!({ "handoffs": handoffs })))
}

async fn create_handoff(
    State(state): State<AppState>,
    payload: Result<Json<NewHandoff>, JsonRejection>,
) -> Result<(StatusCode, Json<Handoff>), AppError> {
    let Json(input) = payload?;
    let handoff = state.store().handoffs().create(&input)?;
    let target = handoff.to_agent.as_deref().unwrap_or("everyone");
    state.hub.record(
        NewEvent::new(kind::HANDOFF_CREATED)
            .agent(&handoff.from_agent)
            .handoff(&handoff.id)
            .task(handoff.task_id.as_deref())
            .data(json!({
                "to": handoff.to_agent,
                "type": handoff.kind,
                "priority": handoff.priority,
            }))
            .message(format!("{} -> {target}: {}", handoff.from_agent, handoff.title)),
    )?;
    Ok((StatusCode::CREATED, Json(handoff)))
}

async fn get_handoff(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Handoff>, AppError> {
    Ok(Json(state.store().handoffs().require(&id)?))
}

async fn claim_handoff(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ClaimRequest>, JsonRejection>,
) -> Result<Json<Handoff>, AppError> {
    let Json(body) = payload?;
    let handoff = state.store().handoffs().claim(&id, &body.agent)?;
    state.hub.record(
        NewEvent::new(kind::HANDOFF_CLAIMED)
            .agent(&body.agent)
            .handoff(&handoff.id)
            .message(format!("{} claimed \"{}\"", body.agent, handoff.title)),
    )?;
    Ok(Json(handoff))
}

async fn resolve_handoff(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Handoff>, AppError> {
    let handoff = state.store().handoffs().resolve(&id)?;
    state.hub.record(
        NewEvent::new(kind::HANDOFF_RESOLVED)
            .handoff(&handoff.id)
            .message(format!("Handoff resolved: {}", handoff.title)),
    )?;
    Ok(Json(handoff))
}

async fn dismiss_handoff(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Handoff>, AppError> {
    let handoff = state.store().handoffs().dismiss(&id)?;
    state.hub.record(
        NewEvent::new(kind::HANDOFF_DISMISSED)
            .handoff(&handoff.id)
            .message(format!("Handoff dismissed: {}", handoff.title)),
    )?;
    Ok(Json(handoff))
}
