//! Audit history and the live event stream

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::sse::{Event as SseFrame, KeepAlive, Sse},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use super::AppState;
use super::error::AppError;
use crate::broadcast::SseEvent;
use crate::model::{Event, NewEvent};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// An event posted by an agent or an external script.
#[derive(Debug, Deserialize)]
pub struct PostEventRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, alias = "agentName", alias = "agent")]
    pub agent_name: Option<String>,
    #[serde(default, alias = "taskId")]
    pub task_id: Option<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, alias = "handoffId")]
    pub handoff_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Build the events router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_events).post(post_event))
        .route("/refresh", post(refresh))
        .route("/stream", get(stream))
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Value>, AppError> {
    let events = state.store().events().list(
        query.kind.as_deref(),
        query.since,
        Some(query.limit.unwrap_or(DEFAULT_LIMIT)),
    )?;
    Ok(Json(json!({ "events": events })))
}

async fn post_event(
    State(state): State<AppState>,
    payload: Result<Json<PostEventRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Event>), AppError> {
    let Json(body) = payload?;
    if body.kind.trim().is_empty() {
        return Err(AppError::BadRequest("type is required".to_string()));
    }
    let mut event = NewEvent::new(body.kind)
        .task(body.task_id.as_deref())
        .session(body.session_id.as_deref());
    if let Some(agent) = &body.agent_name {
        event = event.agent(agent);
    }
    if let Some(handoff) = &body.handoff_id {
        event = event.handoff(handoff);
    }
    if let Some(data) = body.data {
        event = event.data(data);
    }
    if let Some(message) = body.message {
        event = event.message(message);
    }
    let stored = state.hub.record(event)?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// Push a fresh dashboard snapshot to every subscriber.
async fn refresh(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    state.hub.publish_state()?;
    Ok(Json(json!({ "success": true, "subscribers": state.hub.subscriber_count() })))
}

/// Server-sent events: `connected`, a `state` snapshot, then live
/// notifications interleaved with periodic heartbeats.
async fn stream(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<SseFrame, Infallible>>>, AppError> {
    // Subscribe before taking the snapshot so nothing falls in between.
    let rx = state.hub.subscribe();
    let snapshot = state.hub.snapshot()?;
    tracing::debug!(subscribers = state.hub.subscriber_count(), "event stream opened");

    let opening = futures::stream::iter([
        SseEvent::connected(),
        SseEvent::State {
            data: Box::new(snapshot),
        },
    ]);
    let live = BroadcastStream::new(rx).filter_map(|message| async move {
        match message {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event stream subscriber lagged");
                None
            }
        }
    });
    let heartbeats = IntervalStream::new(tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    ))
    .map(|_| SseEvent::heartbeat());

    let frames = opening
        .chain(futures::stream::select(live, heartbeats))
        .map(|event| Ok(frame(&event)))
        .take_until(state.shutdown.clone().cancelled_owned());

    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

fn frame(event: &SseEvent) -> SseFrame {
    match SseFrame::default().json_data(event) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode event for stream");
            SseFrame::default().comment("encoding error")
        }
    }
}
