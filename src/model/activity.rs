//! Sessions, conversation messages, handoff notes and the audit event log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ParseEnumError;

/// Declares a closed string enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError::new($label, other)),
                }
            }
        }
    };
}

string_enum!(
    /// Lifecycle of one agent process run.
    SessionStatus, "session status" {
        Running => "RUNNING",
        Paused => "PAUSED",
        Completed => "COMPLETED",
        Failed => "FAILED",
        Terminated => "TERMINATED",
    }
);

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running | SessionStatus::Paused)
    }
}

string_enum!(
    /// Author of a persisted conversation message.
    MessageRole, "message role" {
        User => "user",
        Assistant => "assistant",
        System => "system",
        Injected => "injected",
    }
);

string_enum!(
    HandoffKind, "handoff type" {
        TaskHandoff => "task-handoff",
        BugReport => "bug-report",
        Clarification => "clarification",
        DesignDoc => "design-doc",
        ReviewRequest => "review-request",
        Blocker => "blocker",
        General => "general",
    }
);

string_enum!(
    HandoffStatus, "handoff status" {
        Pending => "PENDING",
        Claimed => "CLAIMED",
        Resolved => "RESOLVED",
        Dismissed => "DISMISSED",
    }
);

string_enum!(
    /// Handoff urgency. Declaration order is display order, most urgent first.
    HandoffPriority, "handoff priority" {
        Urgent => "urgent",
        High => "high",
        Normal => "normal",
        Low => "low",
    }
);

impl Default for HandoffPriority {
    fn default() -> Self {
        HandoffPriority::Normal
    }
}

/// One run of an agent process, from spawn to exit or supersession.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_name: String,
    /// Conversation id handed to the CLI; shared by every session of one start.
    pub external_session_id: String,
    pub status: SessionStatus,
    pub task_id: Option<String>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub exit_code: Option<i32>,
    pub exit_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub injected: bool,
    pub injected_by: Option<String>,
    /// Strictly increasing within a session, starting at 1.
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

/// Input for appending a message to a session.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub injected_by: Option<String>,
}

impl NewMessage {
    pub fn new(session_id: &str, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            injected_by: None,
        }
    }

    pub fn injected(session_id: &str, content: impl Into<String>, by: &str) -> Self {
        Self {
            injected_by: Some(by.to_string()),
            ..Self::new(session_id, MessageRole::Injected, content)
        }
    }
}

/// A note passed between agents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub id: String,
    pub from_agent: String,
    /// `None` addresses every agent.
    pub to_agent: Option<String>,
    #[serde(rename = "type")]
    pub kind: HandoffKind,
    pub title: String,
    pub content: String,
    pub task_id: Option<String>,
    pub status: HandoffStatus,
    pub claimed_by: Option<String>,
    pub priority: HandoffPriority,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewHandoff {
    pub from_agent: String,
    #[serde(default)]
    pub to_agent: Option<String>,
    #[serde(rename = "type", default = "general_kind")]
    pub kind: HandoffKind,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub priority: Option<HandoffPriority>,
}

fn general_kind() -> HandoffKind {
    HandoffKind::General
}

/// Filter for listing handoffs.
#[derive(Clone, Debug, Default)]
pub struct HandoffFilter {
    pub to_agent: Option<String>,
    pub status: Option<HandoffStatus>,
    pub limit: Option<usize>,
}

/// Records an event may point at.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRefs {
    pub agent_name: Option<String>,
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub handoff_id: Option<String>,
}

/// One entry of the append-only audit log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub refs: EventRefs,
    pub data: Value,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Builder for an audit event before it is stored.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub kind: String,
    pub refs: EventRefs,
    pub data: Value,
    pub message: Option<String>,
}

impl NewEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            refs: EventRefs::default(),
            data: Value::Object(Default::default()),
            message: None,
        }
    }

    pub fn agent(mut self, name: &str) -> Self {
        self.refs.agent_name = Some(name.to_string());
        self
    }

    pub fn task(mut self, id: Option<&str>) -> Self {
        self.refs.task_id = id.map(str::to_string);
        self
    }

    pub fn session(mut self, id: Option<&str>) -> Self {
        self.refs.session_id = id.map(str::to_string);
        self
    }

    pub fn handoff(mut self, id: &str) -> Self {
        self.refs.handoff_id = Some(id.to_string());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Event kinds recorded by the system itself. Externally posted kinds are
/// stored verbatim and need not appear here.
pub mod kind {
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_UPDATED: &str = "task.updated";
    pub const TASK_CLAIMED: &str = "task.claimed";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_QA_STARTED: &str = "task.qa_started";
    pub const TASK_QA_PASSED: &str = "task.qa_passed";
    pub const TASK_QA_FAILED: &str = "task.qa_failed";
    pub const TASK_REVIEW_STARTED: &str = "task.review_started";
    pub const TASK_REVIEWED: &str = "task.reviewed";
    pub const TASK_SHIPPED: &str = "task.shipped";
    pub const TASK_STATUS_CHANGED: &str = "task.status_changed";

    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_STOPPED: &str = "agent.stopped";
    pub const AGENT_PAUSED: &str = "agent.paused";
    pub const AGENT_RESUMED: &str = "agent.resumed";
    pub const AGENT_HEARTBEAT: &str = "agent.heartbeat";
    pub const AGENT_INJECTED: &str = "agent.injected";
    pub const AGENT_REDIRECTED: &str = "agent.redirected";
    pub const AGENT_MESSAGE: &str = "agent.message";
    pub const AGENT_TOOL_START: &str = "agent.tool.start";
    pub const AGENT_TOOL_COMPLETE: &str = "agent.tool.complete";
    pub const AGENT_ERROR: &str = "agent.error";
    pub const AGENT_EXITED: &str = "agent.exited";

    pub const SESSION_STARTED: &str = "session.started";
    pub const SESSION_COMPLETED: &str = "session.completed";
    pub const SESSION_FAILED: &str = "session.failed";

    pub const HANDOFF_CREATED: &str = "handoff.created";
    pub const HANDOFF_CLAIMED: &str = "handoff.claimed";
    pub const HANDOFF_RESOLVED: &str = "handoff.resolved";
    pub const HANDOFF_DISMISSED: &str = "handoff.dismissed";

    pub const SYSTEM_STARTUP: &str = "system.startup";
    pub const SYSTEM_SHUTDOWN: &str = "system.shutdown";

    pub const ORCHESTRATOR_ENABLED: &str = "orchestrator.enabled";
    pub const ORCHESTRATOR_DISABLED: &str = "orchestrator.disabled";
    pub const ORCHESTRATOR_ASSIGNED: &str = "orchestrator.assigned";
    pub const ORCHESTRATOR_WAKE_PO: &str = "orchestrator.wake_po";
    pub const ORCHESTRATOR_WAKE_HANDOFF: &str = "orchestrator.wake_handoff";
    pub const ORCHESTRATOR_WAKE_QA: &str = "orchestrator.wake_qa";
    pub const ORCHESTRATOR_WAKE_REVIEWER: &str = "orchestrator.wake_reviewer";
    pub const ORCHESTRATOR_WAKE_DEVOPS: &str = "orchestrator.wake_devops";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoff_priority_declaration_order_is_urgency_order() {
        assert_eq!(
            HandoffPriority::ALL,
            &[
                HandoffPriority::Urgent,
                HandoffPriority::High,
                HandoffPriority::Normal,
                HandoffPriority::Low
            ]
        );
        assert_eq!(HandoffPriority::default(), HandoffPriority::Normal);
    }

    #[test]
    fn new_handoff_defaults_to_general_kind() {
        let handoff: NewHandoff = serde_json::from_str(
            r#"{"from_agent":"qa","title":"Login broken","content":"Steps..."}"#,
        )
        .unwrap();
        assert_eq!(handoff.kind, HandoffKind::General);
        assert!(handoff.priority.is_none());
    }

    #[test]
    fn event_refs_flatten_into_event_json() {
        let event = Event {
            id: 7,
            kind: kind::AGENT_STARTED.to_string(),
            refs: EventRefs {
                agent_name: Some("dev-alpha".into()),
                ..EventRefs::default()
            },
            data: serde_json::json!({}),
            message: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent.started");
        assert_eq!(json["agent_name"], "dev-alpha");
        assert!(json["task_id"].is_null());
    }

    #[test]
    fn only_running_sessions_are_live() {
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Terminated.is_terminal());
        assert_eq!("injected".parse::<MessageRole>().unwrap(), MessageRole::Injected);
    }
}
