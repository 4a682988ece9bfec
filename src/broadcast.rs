//! Live fan-out of audit events and agent activity to SSE subscribers.
//!
//! [`Hub`] pairs the store with a `tokio::sync::broadcast` channel. Audit
//! events go through [`Hub::record`], which persists before publishing, so a
//! subscriber never sees an event the history endpoint cannot return.
//! High-volume notifications (output chunks, state changes) are published
//! live only. A subscriber that falls behind loses the oldest messages.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::agent::stream_parser::StreamEvent;
use crate::error::StoreError;
use crate::model::{Agent, Event, Handoff, HandoffFilter, NewEvent, Task, TaskFilter};
use crate::orchestration::types::ControllerState;
use crate::store::Store;

const CHANNEL_CAPACITY: usize = 512;

const SNAPSHOT_TASKS: usize = 100;
const SNAPSHOT_HANDOFFS: usize = 50;
const SNAPSHOT_EVENTS: usize = 20;

/// Full dashboard state, sent to each subscriber on connect.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardState {
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    pub handoffs: Vec<Handoff>,
    pub recent_events: Vec<Event>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AgentOutput {
    pub agent: String,
    pub chunk: String,
    pub events: Vec<StreamEvent>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AgentStateChange {
    pub agent: String,
    pub from: ControllerState,
    pub to: ControllerState,
}

#[derive(Clone, Debug, Serialize)]
pub struct AgentErrorNotice {
    pub agent: String,
    pub message: String,
}

/// One server-sent event, serialized as `{"type": ..., ...}`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum SseEvent {
    #[serde(rename = "connected")]
    Connected { timestamp: DateTime<Utc> },
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: DateTime<Utc> },
    #[serde(rename = "state")]
    State { data: Box<DashboardState> },
    #[serde(rename = "event")]
    Event { data: Event },
    #[serde(rename = "agent:output")]
    AgentOutput { data: AgentOutput },
    #[serde(rename = "agent:state")]
    AgentState { data: AgentStateChange },
    #[serde(rename = "agent:error")]
    AgentError { data: AgentErrorNotice },
}

impl SseEvent {
    pub fn connected() -> Self {
        SseEvent::Connected {
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        SseEvent::Heartbeat {
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct Hub {
    store: Store,
    tx: broadcast::Sender<SseEvent>,
}

impl Hub {
    pub fn new(store: Store) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { store, tx }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SseEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish a live-only notification. Having no subscribers is fine.
    pub fn publish(&self, event: SseEvent) {
        let _ = self.tx.send(event);
    }

    /// Persist an audit event, then publish it.
    pub fn record(&self, event: NewEvent) -> Result<Event, StoreError> {
        let stored = self.store.events().record(&event)?;
        self.publish(SseEvent::Event {
            data: stored.clone(),
        });
        Ok(stored)
    }

    /// [`record`](Self::record) for callers that cannot act on a failure.
    pub fn record_or_warn(&self, event: NewEvent) {
        if let Err(e) = self.record(event) {
            tracing::warn!(error = %e, "failed to record event");
        }
    }

    pub fn snapshot(&self) -> Result<DashboardState, StoreError> {
        Ok(DashboardState {
            tasks: self
                .store
                .tasks()
                .list(&TaskFilter::default().limit(SNAPSHOT_TASKS))?,
            agents: self.store.agents().list()?,
            handoffs: self.store.handoffs().list(&HandoffFilter {
                limit: Some(SNAPSHOT_HANDOFFS),
                ..HandoffFilter::default()
            })?,
            recent_events: self.store.events().list(None, None, Some(SNAPSHOT_EVENTS))?,
        })
    }

    /// Push a fresh snapshot to every subscriber.
    pub fn publish_state(&self) -> Result<(), StoreError> {
        let state = self.snapshot()?;
        self.publish(SseEvent::State {
            data: Box::new(state),
        });
        Ok(())
    }
}
