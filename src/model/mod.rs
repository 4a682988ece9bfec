//! Domain records shared by the store, the orchestrator and the HTTP API.

pub mod activity;
pub mod agent;
pub mod task;

pub use activity::{
    Event, EventRefs, Handoff, HandoffFilter, HandoffKind, HandoffPriority, HandoffStatus,
    Message, MessageRole, NewEvent, NewHandoff, NewMessage, Session, SessionStatus, ToolCall,
    ToolResult, kind,
};
pub use agent::{Agent, AgentStatus, AgentType, RosterEntry, default_roster};
pub use task::{NewTask, Priority, Size, Task, TaskFilter, TaskStatus, TaskUpdate};

/// A string did not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}
