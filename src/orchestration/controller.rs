//! Per-agent process controller.
//!
//! [`AgentController`] drives one agent's CLI subprocess through the state
//! machine
//!
//! ```text
//! idle/stopped -> starting -> running <-> paused
//! running/paused -> injecting -> running
//! starting/running/paused/injecting -> stopping -> stopped
//! ```
//!
//! **Concurrency model:** controller state lives behind a `std::sync::Mutex`
//! that is never held across an `.await`. Every check-then-transition happens
//! under one guard, so concurrent callers observe a consistent state.
//!
//! **Generations:** every spawn bumps a generation counter. The pump task
//! reading a process's output tags everything with its generation, and
//! anything from a superseded process is dropped, so an interrupted or killed
//! predecessor never finalizes its replacement's session. Exits are announced
//! on a `watch` channel carrying the highest exited generation, which is what
//! `inject` and `stop` wait on.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use super::process::{ExitInfo, ProcessHandle, ProcessSignal, ProcessSpawner, SpawnRequest};
use super::types::{ControllerEvent, ControllerState, ProcessTimeouts, RunningAgent};
use crate::agent::prompt::{self, RuntimeInfo};
use crate::agent::stream_parser::{StreamEvent, StreamParser};
use crate::agent::transcript::TranscriptWriter;
use crate::broadcast::Hub;
use crate::error::{ControllerError, StoreError};
use crate::model::{
    AgentStatus, AgentType, MessageRole, NewEvent, NewMessage, SessionStatus, ToolCall,
    ToolResult, kind,
};
use crate::store::Store;

/// Capacity of the output channel to the owner. Output beyond this is dropped.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// How long to keep reading output after the exit notification arrives.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

/// Longest injected-message excerpt kept in the audit event.
const INJECT_PREVIEW_CHARS: usize = 100;

/// Static configuration for one controller.
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    pub agent_name: String,
    pub agent_type: AgentType,
    pub agency_dir: PathBuf,
    pub data_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub api_base: String,
    /// The agent CLI executable.
    pub cli_command: String,
    pub timeouts: ProcessTimeouts,
}

/// Receiving ends of a controller's notifications.
pub struct ControllerChannels {
    /// State changes, messages, tool activity, errors and exits, in order.
    pub lifecycle: mpsc::UnboundedReceiver<ControllerEvent>,
    /// Raw output chunks. Bounded; the controller drops output when full.
    pub output: mpsc::Receiver<ControllerEvent>,
}

#[derive(Clone)]
pub struct AgentController {
    shared: Arc<Shared>,
}

struct Shared {
    opts: ControllerOptions,
    hub: Hub,
    spawner: Arc<dyn ProcessSpawner>,
    /// The CLI conversation id, fixed for the controller's lifetime so every
    /// resume continues the same conversation.
    external_session_id: String,
    lifecycle: mpsc::UnboundedSender<ControllerEvent>,
    output: mpsc::Sender<ControllerEvent>,
    exited: watch::Sender<u64>,
    inner: Mutex<Inner>,
}

/// Assistant output accumulated since the last message boundary.
#[derive(Default)]
struct Turn {
    text: String,
    tool_calls: Vec<ToolCall>,
    tool_results: Vec<ToolResult>,
}

impl Turn {
    fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.tool_calls.is_empty() && self.tool_results.is_empty()
    }
}

struct Inner {
    state: ControllerState,
    generation: u64,
    process: Option<Arc<dyn ProcessHandle>>,
    pid: Option<u32>,
    session_id: Option<String>,
    task_id: Option<String>,
    working_on: Option<String>,
    parser: StreamParser,
    turn: Turn,
    injections: VecDeque<(String, String)>,
    transcript: Option<TranscriptWriter>,
    dropped_output: u64,
}

impl AgentController {
    pub fn new(
        opts: ControllerOptions,
        hub: Hub,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> (Self, ControllerChannels) {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exited, _) = watch::channel(0);
        let controller = Self {
            shared: Arc::new(Shared {
                opts,
                hub,
                spawner,
                external_session_id: Uuid::new_v4().to_string(),
                lifecycle: lifecycle_tx,
                output: output_tx,
                exited,
                inner: Mutex::new(Inner {
                    state: ControllerState::Idle,
                    generation: 0,
                    process: None,
                    pid: None,
                    session_id: None,
                    task_id: None,
                    working_on: None,
                    parser: StreamParser::new(),
                    turn: Turn::default(),
                    injections: VecDeque::new(),
                    transcript: None,
                    dropped_output: 0,
                }),
            }),
        };
        let channels = ControllerChannels {
            lifecycle: lifecycle_rx,
            output: output_rx,
        };
        (controller, channels)
    }

    // ─── Getters ───

    pub fn name(&self) -> &str {
        &self.shared.opts.agent_name
    }

    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn task_id(&self) -> Option<String> {
        self.lock().task_id.clone()
    }

    pub fn external_session_id(&self) -> &str {
        &self.shared.external_session_id
    }

    /// Output chunks dropped because the owner fell behind.
    pub fn dropped_output(&self) -> u64 {
        self.lock().dropped_output
    }

    pub fn snapshot(&self) -> RunningAgent {
        let inner = self.lock();
        RunningAgent {
            name: self.name().to_string(),
            state: inner.state,
            pid: inner.pid,
            session_id: inner.session_id.clone(),
            task_id: inner.task_id.clone(),
        }
    }

    // ─── Start ───

    /// Launch the agent, optionally on a task. Legal from idle or stopped.
    pub async fn start(&self, task_id: Option<&str>) -> Result<(), ControllerError> {
        self.reserve_start()?;
        self.launch(task_id).await
    }

    /// Claim the start transition without launching yet. Lets the manager
    /// register the controller and move it to `starting` under one guard.
    pub(crate) fn reserve_start(&self) -> Result<(), ControllerError> {
        let mut inner = self.lock();
        if !inner.state.is_startable() {
            return Err(ControllerError::InvalidState {
                op: "start",
                state: inner.state,
            });
        }
        self.transition(&mut inner, ControllerState::Starting);
        Ok(())
    }

    /// Second half of [`start`](Self::start); expects the `starting` state.
    pub(crate) async fn launch(&self, task_id: Option<&str>) -> Result<(), ControllerError> {
        let result = self.try_launch(task_id).await;
        if let Err(e) = &result {
            let session_id = {
                let mut inner = self.lock();
                if inner.state != ControllerState::Starting {
                    None
                } else {
                    self.transition(&mut inner, ControllerState::Idle);
                    inner.session_id.clone()
                }
            };
            if let Some(session_id) = session_id {
                self.warn_on_err(
                    "finish failed session",
                    self.store()
                        .sessions()
                        .finish(&session_id, SessionStatus::Failed, None, Some(&e.to_string())),
                );
            }
            tracing::warn!(agent = %self.name(), error = %e, "agent failed to start");
        }
        result
    }

    async fn try_launch(&self, task_id: Option<&str>) -> Result<(), ControllerError> {
        let opts = &self.shared.opts;
        let name = opts.agent_name.as_str();
        let store = self.store();

        let prompt = prompt::build_launch_prompt(store, &self.runtime_info(), task_id).await?;
        self.ensure_state("start", ControllerState::Starting)?;

        let session = store
            .sessions()
            .create(name, &self.shared.external_session_id, task_id)?;
        {
            let mut inner = self.lock();
            if inner.state != ControllerState::Starting {
                let state = inner.state;
                drop(inner);
                self.retire_aborted_session(&session.id, "stopped during start");
                return Err(ControllerError::InvalidState { op: "start", state });
            }
            inner.session_id = Some(session.id.clone());
        }

        let mut transcript = self.open_transcript(&session.id);
        if let Some(t) = transcript.as_mut() {
            t.prompt(&prompt);
        }
        store
            .messages()
            .append(&NewMessage::new(&session.id, MessageRole::User, prompt.clone()))?;

        let spawned = self.shared.spawner.spawn(self.request(self.launch_args(&prompt)))?;
        let pid = spawned.handle.pid();
        let working_on = match task_id {
            Some(id) => format!("Working on task {id}"),
            None => "Starting...".to_string(),
        };

        let updated = store
            .sessions()
            .set_pid(&session.id, pid)
            .and_then(|_| {
                store
                    .agents()
                    .update_status(name, AgentStatus::Working, Some(&working_on), None)
            })
            .and_then(|_| {
                store
                    .agents()
                    .update_session(name, Some(&session.id), pid, task_id)
            });
        if let Err(e) = updated {
            let _ = spawned.handle.signal(ProcessSignal::Kill);
            return Err(e.into());
        }

        let generation = {
            let mut inner = self.lock();
            if inner.state != ControllerState::Starting {
                let state = inner.state;
                drop(inner);
                let _ = spawned.handle.signal(ProcessSignal::Kill);
                self.retire_aborted_session(&session.id, "stopped during start");
                return Err(ControllerError::InvalidState { op: "start", state });
            }
            inner.generation += 1;
            inner.process = Some(spawned.handle.clone());
            inner.pid = pid;
            inner.task_id = task_id.map(str::to_string);
            inner.working_on = Some(working_on);
            inner.parser.reset();
            inner.turn = Turn::default();
            inner.transcript = transcript;
            self.transition(&mut inner, ControllerState::Running);
            inner.generation
        };
        self.attach(generation, spawned.output, spawned.exit);

        self.shared.hub.record_or_warn(
            NewEvent::new(kind::AGENT_STARTED)
                .agent(name)
                .task(task_id)
                .session(Some(&session.id))
                .data(json!({ "pid": pid, "sessionId": session.id }))
                .message(format!("Agent {name} started")),
        );
        tracing::info!(agent = %name, pid = ?pid, task_id = ?task_id, "agent started");
        Ok(())
    }

    // ─── Pause / resume ───

    /// Suspend the process with SIGSTOP. Legal from running.
    pub fn pause(&self, reason: Option<&str>) -> Result<(), ControllerError> {
        let name = self.name();
        let (session_id, task_id, working_on) = {
            let mut inner = self.lock();
            let handle = match (&inner.process, inner.state) {
                (Some(handle), ControllerState::Running) => handle.clone(),
                (_, state) => return Err(ControllerError::InvalidState { op: "pause", state }),
            };
            handle.signal(ProcessSignal::Suspend)?;
            self.transition(&mut inner, ControllerState::Paused);
            (
                inner.session_id.clone(),
                inner.task_id.clone(),
                inner.working_on.clone(),
            )
        };

        let store = self.store();
        self.warn_on_err(
            "mark agent paused",
            store
                .agents()
                .update_status(name, AgentStatus::Paused, working_on.as_deref(), reason)
                .map(drop),
        );
        if let Some(session_id) = &session_id {
            self.warn_on_err(
                "mark session paused",
                store
                    .sessions()
                    .finish(session_id, SessionStatus::Paused, None, None),
            );
        }
        self.shared.hub.record_or_warn(
            NewEvent::new(kind::AGENT_PAUSED)
                .agent(name)
                .task(task_id.as_deref())
                .session(session_id.as_deref())
                .data(json!({ "reason": reason }))
                .message(match reason {
                    Some(reason) => format!("Agent {name} paused: {reason}"),
                    None => format!("Agent {name} paused"),
                }),
        );
        Ok(())
    }

    /// Continue a paused process with SIGCONT. Legal from paused.
    pub fn resume(&self) -> Result<(), ControllerError> {
        let name = self.name();
        let (session_id, task_id, working_on) = {
            let mut inner = self.lock();
            let handle = match (&inner.process, inner.state) {
                (Some(handle), ControllerState::Paused) => handle.clone(),
                (_, state) => return Err(ControllerError::InvalidState { op: "resume", state }),
            };
            handle.signal(ProcessSignal::Continue)?;
            self.transition(&mut inner, ControllerState::Running);
            (
                inner.session_id.clone(),
                inner.task_id.clone(),
                inner.working_on.clone(),
            )
        };

        let store = self.store();
        self.warn_on_err(
            "mark agent working",
            store
                .agents()
                .update_status(name, AgentStatus::Working, working_on.as_deref(), None)
                .map(drop),
        );
        if let Some(session_id) = &session_id {
            self.warn_on_err(
                "mark session running",
                store
                    .sessions()
                    .finish(session_id, SessionStatus::Running, None, None),
            );
        }
        self.shared.hub.record_or_warn(
            NewEvent::new(kind::AGENT_RESUMED)
                .agent(name)
                .task(task_id.as_deref())
                .session(session_id.as_deref())
                .message(format!("Agent {name} resumed")),
        );
        Ok(())
    }

    // ─── Injection ───

    /// Interrupt the agent and resume its conversation with `message`.
    ///
    /// Legal from running or paused. While an injection is already in
    /// flight the message is queued and delivered after it.
    pub async fn inject(&self, message: &str, injected_by: &str) -> Result<(), ControllerError> {
        let was_paused = {
            let mut inner = self.lock();
            match inner.state {
                ControllerState::Injecting => {
                    inner
                        .injections
                        .push_back((message.to_string(), injected_by.to_string()));
                    tracing::debug!(agent = %self.name(), queued = inner.injections.len(), "injection queued");
                    return Ok(());
                }
                ControllerState::Running | ControllerState::Paused => {
                    let was_paused = inner.state == ControllerState::Paused;
                    self.transition(&mut inner, ControllerState::Injecting);
                    was_paused
                }
                state => return Err(ControllerError::InvalidState { op: "inject", state }),
            }
        };
        self.run_injections(message.to_string(), injected_by.to_string(), was_paused)
            .await
    }

    /// Deliver `first`, then anything queued behind it. Expects `injecting`.
    async fn run_injections(
        &self,
        first: String,
        first_by: String,
        mut was_paused: bool,
    ) -> Result<(), ControllerError> {
        let mut next = Some((first, first_by));
        while let Some((message, injected_by)) = next.take() {
            if let Err(e) = self.deliver(&message, &injected_by, was_paused).await {
                self.abandon_injection(&e);
                return Err(e);
            }
            was_paused = false;
            next = {
                let mut inner = self.lock();
                if inner.state != ControllerState::Injecting {
                    None
                } else {
                    let next = inner.injections.pop_front();
                    if next.is_none() {
                        self.transition(&mut inner, ControllerState::Running);
                    }
                    next
                }
            };
        }
        Ok(())
    }

    async fn deliver(
        &self,
        message: &str,
        injected_by: &str,
        was_paused: bool,
    ) -> Result<(), ControllerError> {
        let opts = &self.shared.opts;
        let name = opts.agent_name.as_str();
        let store = self.store();

        // 1. Interrupt the current process and wait for it to go away.
        let (generation, current) = {
            let inner = self.lock();
            (inner.generation, inner.process.clone())
        };
        if let Some(handle) = current {
            self.send_signal(&*handle, ProcessSignal::Interrupt);
            if was_paused {
                self.send_signal(&*handle, ProcessSignal::Continue);
            }
            if !self.wait_for_exit(generation, opts.timeouts.inject_wait).await {
                let message = format!(
                    "process did not exit within {:?} of interrupt; killing it before resuming",
                    opts.timeouts.inject_wait
                );
                tracing::warn!(agent = %name, pid = ?handle.pid(), "{message}");
                self.emit(ControllerEvent::Error { message });
                self.send_signal(&*handle, ProcessSignal::Kill);
                if !self.wait_for_exit(generation, opts.timeouts.kill_settle).await {
                    tracing::warn!(agent = %name, pid = ?handle.pid(), "killed process not reaped yet");
                }
            }
        }

        // 2. Retire the old session and open one on the same conversation.
        let (old_session, task_id, working_on) = {
            let inner = self.lock();
            if inner.state != ControllerState::Injecting {
                return Err(ControllerError::InvalidState {
                    op: "inject",
                    state: inner.state,
                });
            }
            (
                inner.session_id.clone(),
                inner.task_id.clone(),
                inner.working_on.clone(),
            )
        };
        if let Some(old) = &old_session {
            store.sessions().finish(
                old,
                SessionStatus::Terminated,
                None,
                Some("superseded by injection"),
            )?;
        }
        let session = store.sessions().create(
            name,
            &self.shared.external_session_id,
            task_id.as_deref(),
        )?;
        store
            .messages()
            .append(&NewMessage::injected(&session.id, message, injected_by))?;
        let mut transcript = self.open_transcript(&session.id);
        if let Some(t) = transcript.as_mut() {
            t.injected(message, injected_by);
        }
        self.shared.hub.record_or_warn(
            NewEvent::new(kind::AGENT_INJECTED)
                .agent(name)
                .task(task_id.as_deref())
                .session(Some(&session.id))
                .data(json!({
                    "injectedBy": injected_by,
                    "content": preview(message, INJECT_PREVIEW_CHARS),
                }))
                .message(format!("Message injected into {name} by {injected_by}")),
        );

        // 3. Respawn with --resume and hand the message to the new process.
        let spawned = match self.shared.spawner.spawn(self.request(self.resume_args())) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.warn_on_err(
                    "finish failed session",
                    store.sessions().finish(
                        &session.id,
                        SessionStatus::Failed,
                        None,
                        Some(&e.to_string()),
                    ),
                );
                return Err(e.into());
            }
        };
        let pid = spawned.handle.pid();
        store.sessions().set_pid(&session.id, pid)?;

        let generation = {
            let mut inner = self.lock();
            if inner.state != ControllerState::Injecting {
                let state = inner.state;
                drop(inner);
                let _ = spawned.handle.signal(ProcessSignal::Kill);
                self.retire_aborted_session(&session.id, "stopped during injection");
                return Err(ControllerError::InvalidState { op: "inject", state });
            }
            inner.generation += 1;
            inner.process = Some(spawned.handle.clone());
            inner.pid = pid;
            inner.session_id = Some(session.id.clone());
            inner.parser.reset();
            inner.turn = Turn::default();
            inner.transcript = transcript;
            inner.generation
        };
        self.attach(generation, spawned.output, spawned.exit);
        spawned.handle.write(format!("{message}\n").as_bytes())?;

        store.agents().update_status(
            name,
            AgentStatus::Working,
            working_on.as_deref(),
            None,
        )?;
        store
            .agents()
            .update_session(name, Some(&session.id), pid, task_id.as_deref())?;
        tracing::info!(agent = %name, injected_by = %injected_by, pid = ?pid, "message injected");
        Ok(())
    }

    fn ensure_state(&self, op: &'static str, expected: ControllerState) -> Result<(), ControllerError> {
        let state = self.lock().state;
        if state != expected {
            return Err(ControllerError::InvalidState { op, state });
        }
        Ok(())
    }

    /// A stop overtook a launch after its session was opened. The stop has
    /// already settled the controller, so terminate the orphaned session and
    /// take the agent record offline again.
    fn retire_aborted_session(&self, session_id: &str, reason: &str) {
        let name = self.name();
        let store = self.store();
        self.warn_on_err(
            "terminate aborted session",
            store
                .sessions()
                .finish(session_id, SessionStatus::Terminated, None, Some(reason)),
        );
        self.warn_on_err(
            "reset agent after aborted launch",
            store
                .agents()
                .update_status(name, AgentStatus::Offline, None, None)
                .and_then(|_| store.agents().update_session(name, None, None, None)),
        );
        tracing::info!(agent = %name, session_id = %session_id, reason, "launch aborted by stop");
    }

    /// An injection failed midway: fall back to idle, dropping the queue.
    fn abandon_injection(&self, error: &ControllerError) {
        tracing::warn!(agent = %self.name(), error = %error, "injection failed");
        let process = {
            let mut inner = self.lock();
            if inner.state != ControllerState::Injecting {
                return;
            }
            inner.injections.clear();
            self.transition(&mut inner, ControllerState::Idle);
            inner.process.take()
        };
        if let Some(handle) = process {
            self.send_signal(&*handle, ProcessSignal::Kill);
        }
        self.emit(ControllerEvent::Error {
            message: error.to_string(),
        });
        self.set_agent_idle();
    }

    /// Point the agent at another task by injecting an urgent instruction.
    pub async fn redirect(&self, task_id: &str) -> Result<(), ControllerError> {
        {
            let mut inner = self.lock();
            if !inner.state.is_active() {
                return Err(ControllerError::InvalidState {
                    op: "redirect",
                    state: inner.state,
                });
            }
            inner.task_id = Some(task_id.to_string());
            inner.working_on = Some(format!("Working on task {task_id}"));
        }
        self.inject(&prompt::redirect_message(task_id), "orchestrator")
            .await
    }

    // ─── Stop ───

    /// Interrupt, escalate to SIGKILL after the grace period, and settle in
    /// `stopped` within the overall bound.
    pub async fn stop(&self) -> Result<(), ControllerError> {
        let opts = &self.shared.opts;
        let name = opts.agent_name.as_str();
        let deadline = Instant::now() + opts.timeouts.stop_bound;

        let (generation, current, was_paused) = {
            let mut inner = self.lock();
            match inner.state {
                ControllerState::Idle | ControllerState::Stopped | ControllerState::Stopping => {
                    return Ok(());
                }
                state => {
                    self.transition(&mut inner, ControllerState::Stopping);
                    inner.injections.clear();
                    (
                        inner.generation,
                        inner.process.clone(),
                        state == ControllerState::Paused,
                    )
                }
            }
        };

        if let Some(handle) = current {
            self.send_signal(&*handle, ProcessSignal::Interrupt);
            if was_paused {
                self.send_signal(&*handle, ProcessSignal::Continue);
            }
            if !self.wait_for_exit(generation, opts.timeouts.stop_grace).await {
                tracing::warn!(agent = %name, pid = ?handle.pid(), "no exit after interrupt; sending SIGKILL");
                self.send_signal(&*handle, ProcessSignal::Kill);
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !self.wait_for_exit(generation, remaining).await {
                    tracing::warn!(agent = %name, pid = ?handle.pid(), "process still not reaped at stop bound");
                }
            }
        }

        let (session_id, task_id) = {
            let mut inner = self.lock();
            inner.process = None;
            inner.pid = None;
            inner.transcript = None;
            inner.working_on = None;
            inner.turn = Turn::default();
            (inner.session_id.take(), inner.task_id.take())
        };

        let store = self.store();
        if let Some(session_id) = &session_id {
            self.warn_on_err(
                "finish stopped session",
                store.sessions().finish(
                    session_id,
                    SessionStatus::Terminated,
                    None,
                    Some("stopped"),
                ),
            );
        }
        self.warn_on_err(
            "mark agent offline",
            store
                .agents()
                .update_status(name, AgentStatus::Offline, None, None)
                .and_then(|_| store.agents().update_session(name, None, None, None)),
        );
        self.shared.hub.record_or_warn(
            NewEvent::new(kind::AGENT_STOPPED)
                .agent(name)
                .task(task_id.as_deref())
                .session(session_id.as_deref())
                .message(format!("Agent {name} stopped")),
        );

        let mut inner = self.lock();
        self.transition(&mut inner, ControllerState::Stopped);
        tracing::info!(agent = %name, "agent stopped");
        Ok(())
    }

    // ─── Process pump ───

    fn attach(
        &self,
        generation: u64,
        mut output: mpsc::Receiver<Vec<u8>>,
        mut exit: oneshot::Receiver<ExitInfo>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let info = loop {
                tokio::select! {
                    biased;
                    chunk = output.recv() => match chunk {
                        Some(chunk) => this.handle_output(generation, &chunk),
                        None => break (&mut exit).await.unwrap_or_default(),
                    },
                    info = &mut exit => {
                        while let Ok(Some(chunk)) = tokio::time::timeout(EXIT_DRAIN, output.recv()).await {
                            this.handle_output(generation, &chunk);
                        }
                        break info.unwrap_or_default();
                    }
                }
            };
            this.handle_exit(generation, info);
        });
    }

    fn handle_output(&self, generation: u64, chunk: &[u8]) {
        let events = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            let events = inner.parser.parse(chunk);
            self.absorb(&mut inner, &events);
            events
        };

        self.send_output(String::from_utf8_lossy(chunk).into_owned(), events);
        self.warn_on_err("heartbeat", self.store().agents().heartbeat(self.name()));
    }

    /// Must not be called with the inner lock held.
    fn send_output(&self, chunk: String, events: Vec<StreamEvent>) {
        let event = ControllerEvent::Output { chunk, events };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.shared.output.try_send(event) {
            let dropped = {
                let mut inner = self.lock();
                inner.dropped_output += 1;
                inner.dropped_output
            };
            tracing::debug!(agent = %self.name(), dropped, "output channel full; chunk dropped");
        }
    }

    /// Fold parsed events into the current turn, persisting at boundaries.
    fn absorb(&self, inner: &mut Inner, events: &[StreamEvent]) {
        for event in events {
            if let Some(t) = inner.transcript.as_mut() {
                t.event(event);
            }
            match event {
                StreamEvent::Content {
                    text,
                    role: Some(MessageRole::Assistant),
                    ..
                } => inner.turn.text.push_str(text),
                StreamEvent::ToolUse {
                    id,
                    name,
                    input,
                    partial,
                } => {
                    if !partial {
                        inner.turn.tool_calls.push(ToolCall {
                            id: id.clone().unwrap_or_default(),
                            name: name.clone().unwrap_or_default(),
                            input: input.clone(),
                        });
                    }
                    if name.is_some() {
                        self.emit(ControllerEvent::ToolStart {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }
                }
                StreamEvent::ToolResult {
                    id,
                    content,
                    is_error,
                } => {
                    inner.turn.tool_results.push(ToolResult {
                        tool_use_id: id.clone().unwrap_or_default(),
                        content: content.clone(),
                        is_error: *is_error,
                    });
                    self.emit(ControllerEvent::ToolComplete {
                        id: id.clone(),
                        content: content.clone(),
                        is_error: *is_error,
                    });
                }
                StreamEvent::Error { message } => {
                    self.emit(ControllerEvent::Error {
                        message: message.clone(),
                    });
                }
                StreamEvent::TurnComplete {
                    usage: Some(usage), ..
                } => {
                    if let Some(session_id) = &inner.session_id {
                        self.warn_on_err(
                            "record token usage",
                            self.store().sessions().add_usage(
                                session_id,
                                usage.input_tokens,
                                usage.output_tokens,
                            ),
                        );
                    }
                }
                _ => {}
            }
            if event.is_boundary() {
                self.persist_turn(inner);
            }
        }
    }

    fn persist_turn(&self, inner: &mut Inner) {
        let turn = std::mem::take(&mut inner.turn);
        if turn.is_empty() {
            return;
        }
        let Some(session_id) = inner.session_id.clone() else {
            return;
        };
        let message = NewMessage {
            tool_calls: turn.tool_calls,
            tool_results: turn.tool_results,
            ..NewMessage::new(&session_id, MessageRole::Assistant, turn.text)
        };
        match self.store().messages().append(&message) {
            Ok(message) => self.emit(ControllerEvent::Message {
                session_id,
                message,
            }),
            Err(e) => tracing::warn!(agent = %self.name(), error = %e, "failed to persist message"),
        }
    }

    fn handle_exit(&self, generation: u64, info: ExitInfo) {
        let name = self.name();
        let mut inner = self.lock();
        if inner.generation != generation {
            drop(inner);
            self.notify_exit(generation);
            return;
        }

        let trailing = inner.parser.flush();
        self.absorb(&mut inner, &trailing);
        self.persist_turn(&mut inner);
        if let Some(t) = inner.transcript.as_mut() {
            t.exit(info.code, info.signal.as_deref());
        }
        inner.process = None;
        inner.pid = None;

        let state = inner.state;
        let expected = matches!(
            state,
            ControllerState::Injecting | ControllerState::Stopping | ControllerState::Stopped
        );
        if !expected {
            if let Some(session_id) = &inner.session_id {
                let (status, reason) = if info.success() {
                    (SessionStatus::Completed, None)
                } else if let Some(signal) = &info.signal {
                    (SessionStatus::Failed, Some(format!("signal {signal}")))
                } else {
                    (
                        SessionStatus::Failed,
                        Some(format!("exit code {}", info.code.unwrap_or(-1))),
                    )
                };
                self.warn_on_err(
                    "finalize session",
                    self.store()
                        .sessions()
                        .finish(session_id, status, info.code, reason.as_deref()),
                );
                let event_kind = if status == SessionStatus::Completed {
                    kind::SESSION_COMPLETED
                } else {
                    kind::SESSION_FAILED
                };
                self.shared.hub.record_or_warn(
                    NewEvent::new(event_kind)
                        .agent(name)
                        .task(inner.task_id.as_deref())
                        .session(Some(session_id))
                        .data(json!({ "exitCode": info.code, "signal": info.signal, "reason": reason })),
                );
            }
        }

        let queued = match (state, inner.injections.pop_front()) {
            (ControllerState::Running | ControllerState::Paused, Some(next)) => Some(next),
            (_, Some(next)) => {
                inner.injections.push_front(next);
                None
            }
            (_, None) => None,
        };
        let went_idle = match &queued {
            Some(_) => {
                self.transition(&mut inner, ControllerState::Injecting);
                false
            }
            None if !expected => {
                self.transition(&mut inner, ControllerState::Idle);
                true
            }
            None => false,
        };
        let session_id = inner.session_id.clone();
        let task_id = inner.task_id.clone();
        drop(inner);

        if !trailing.is_empty() {
            self.send_output(String::new(), trailing);
        }
        if went_idle {
            self.set_agent_idle();
            self.shared.hub.record_or_warn(
                NewEvent::new(kind::AGENT_EXITED)
                    .agent(name)
                    .task(task_id.as_deref())
                    .session(session_id.as_deref())
                    .data(json!({ "exitCode": info.code, "signal": info.signal }))
                    .message(format!("Agent {name} exited")),
            );
        }
        tracing::info!(agent = %name, code = ?info.code, signal = ?info.signal, state = %state, "agent process exited");
        self.emit(ControllerEvent::Exit {
            code: info.code,
            signal: info.signal,
        });
        self.notify_exit(generation);

        if let Some((message, injected_by)) = queued {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.run_injections(message, injected_by, false).await {
                    tracing::warn!(agent = %this.name(), error = %e, "queued injection failed");
                }
            });
        }
    }

    // ─── Helpers ───

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap()
    }

    fn store(&self) -> &Store {
        self.shared.hub.store()
    }

    fn transition(&self, inner: &mut Inner, to: ControllerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::debug!(agent = %self.name(), %from, %to, "controller state");
        self.emit(ControllerEvent::State { from, to });
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.shared.lifecycle.send(event);
    }

    fn notify_exit(&self, generation: u64) {
        self.shared.exited.send_if_modified(|exited| {
            if *exited < generation {
                *exited = generation;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the process of `generation` has exited, up to `limit`.
    async fn wait_for_exit(&self, generation: u64, limit: Duration) -> bool {
        let mut rx = self.shared.exited.subscribe();
        let result = tokio::time::timeout(limit, rx.wait_for(|g| *g >= generation)).await;
        matches!(result, Ok(Ok(_)))
    }

    fn send_signal(&self, handle: &dyn ProcessHandle, signal: ProcessSignal) {
        if let Err(e) = handle.signal(signal) {
            tracing::warn!(agent = %self.name(), signal = signal.name(), error = %e, "signal failed");
        }
    }

    fn set_agent_idle(&self) {
        let name = self.name();
        let store = self.store();
        let (session_id, task_id) = {
            let inner = self.lock();
            (inner.session_id.clone(), inner.task_id.clone())
        };
        self.warn_on_err(
            "mark agent idle",
            store
                .agents()
                .update_status(name, AgentStatus::Idle, None, None)
                .and_then(|_| {
                    store.agents().update_session(
                        name,
                        session_id.as_deref(),
                        None,
                        task_id.as_deref(),
                    )
                }),
        );
    }

    fn warn_on_err<T>(&self, what: &str, result: Result<T, StoreError>) {
        if let Err(e) = result {
            tracing::warn!(agent = %self.name(), error = %e, "failed to {what}");
        }
    }

    fn open_transcript(&self, session_id: &str) -> Option<TranscriptWriter> {
        match TranscriptWriter::open(&self.shared.opts.data_dir, session_id) {
            Ok(writer) => Some(writer),
            Err(e) => {
                tracing::warn!(agent = %self.name(), error = %e, "cannot open transcript");
                None
            }
        }
    }

    fn runtime_info(&self) -> RuntimeInfo {
        let opts = &self.shared.opts;
        RuntimeInfo {
            agent_name: opts.agent_name.clone(),
            agent_type: opts.agent_type,
            agency_dir: opts.agency_dir.clone(),
            data_dir: opts.data_dir.clone(),
            projects_dir: opts.projects_dir.clone(),
            api_base: opts.api_base.clone(),
            external_session_id: self.shared.external_session_id.clone(),
        }
    }

    fn launch_args(&self, prompt: &str) -> Vec<String> {
        vec![
            "-p".into(),
            prompt.into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--session-id".into(),
            self.shared.external_session_id.clone(),
            "--dangerously-skip-permissions".into(),
        ]
    }

    fn resume_args(&self) -> Vec<String> {
        vec![
            "--resume".into(),
            self.shared.external_session_id.clone(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--dangerously-skip-permissions".into(),
        ]
    }

    fn request(&self, args: Vec<String>) -> SpawnRequest {
        let opts = &self.shared.opts;
        let mut request = SpawnRequest::new(&opts.cli_command, args, opts.projects_dir.clone());
        request.env = vec![
            ("AGENCY_DIR".into(), opts.agency_dir.display().to_string()),
            ("DATA_DIR".into(), opts.data_dir.display().to_string()),
            ("PROJECTS_DIR".into(), opts.projects_dir.display().to_string()),
            ("AGENCY_AGENT".into(), opts.agent_name.clone()),
        ];
        request
    }
}

/// First `max` characters of `text`, with an ellipsis when cut.
pub(crate) fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_cuts_on_char_boundaries() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn empty_turn_is_not_persisted() {
        let mut turn = Turn::default();
        assert!(turn.is_empty());
        turn.text.push_str("  \n");
        assert!(turn.is_empty());
        turn.tool_results.push(ToolResult {
            tool_use_id: "t".into(),
            content: String::new(),
            is_error: false,
        });
        assert!(!turn.is_empty());
    }
}
