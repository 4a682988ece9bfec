//! Shared vocabulary between the controller, the manager and the HTTP layer.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::agent::stream_parser::StreamEvent;
use crate::model::Message;

/// Lifecycle state of one agent's process controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Idle,
    Starting,
    Running,
    Paused,
    Injecting,
    Stopping,
    Stopped,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Starting => "starting",
            ControllerState::Running => "running",
            ControllerState::Paused => "paused",
            ControllerState::Injecting => "injecting",
            ControllerState::Stopping => "stopping",
            ControllerState::Stopped => "stopped",
        }
    }

    /// Idle or stopped: a new process may be started.
    pub fn is_startable(self) -> bool {
        matches!(self, ControllerState::Idle | ControllerState::Stopped)
    }

    /// Has a live process the orchestrator should leave alone. Starting and
    /// stopping are transitional and excluded.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ControllerState::Running | ControllerState::Paused | ControllerState::Injecting
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wait bounds for signal-driven transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessTimeouts {
    /// How long `inject` waits for the interrupted process to exit.
    pub inject_wait: Duration,
    /// How long `stop` waits after SIGINT before escalating to SIGKILL.
    pub stop_grace: Duration,
    /// Overall bound on `stop`.
    pub stop_bound: Duration,
    /// How long to wait for a SIGKILLed process to be reaped.
    pub kill_settle: Duration,
}

impl Default for ProcessTimeouts {
    fn default() -> Self {
        Self {
            inject_wait: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
            stop_bound: Duration::from_secs(10),
            kill_settle: Duration::from_secs(1),
        }
    }
}

/// Snapshot of a live controller, as listed by `/api/agents/running`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningAgent {
    pub name: String,
    pub state: ControllerState,
    pub pid: Option<u32>,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
}

/// Returned by a successful `start_agent`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub pid: Option<u32>,
    pub session_id: Option<String>,
}

/// One agent started by an orchestration pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub agent: String,
    pub task_id: Option<String>,
    pub reason: &'static str,
}

/// A failure inside one orchestration pass.
#[derive(Clone, Debug, Serialize)]
pub struct PassError {
    pub pass: &'static str,
    pub message: String,
}

/// What a single orchestration cycle did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CycleReport {
    pub started: Vec<Assignment>,
    pub errors: Vec<PassError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationStatus {
    pub enabled: bool,
    pub interval_ms: u64,
}

/// Notifications a controller sends to its owner.
#[derive(Clone, Debug)]
pub enum ControllerEvent {
    State {
        from: ControllerState,
        to: ControllerState,
    },
    /// A raw output chunk and the events parsed from it.
    Output {
        chunk: String,
        events: Vec<StreamEvent>,
    },
    /// An assistant message was persisted.
    Message {
        session_id: String,
        message: Message,
    },
    ToolStart {
        id: Option<String>,
        name: Option<String>,
        input: Value,
    },
    ToolComplete {
        id: Option<String>,
        content: String,
        is_error: bool,
    },
    Error {
        message: String,
    },
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
}
