//! Registry of live agent controllers and the auto-orchestration timer.
//!
//! [`AgentManager`] is the single owner of every [`AgentController`]. It wraps
//! a `HashMap` behind `Arc<Mutex<..>>`; the check for an existing controller,
//! the insertion of a new one and its move into `starting` all happen under
//! one guard, so two concurrent starts for the same agent can never both
//! succeed.
//!
//! Each controller's notifications are relayed by a forwarder task: state
//! changes and output go to SSE subscribers live, while messages, tool
//! activity and errors are also recorded as audit events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::controller::{AgentController, ControllerChannels, ControllerOptions, preview};
use super::process::ProcessSpawner;
use super::types::{
    ControllerEvent, ControllerState, OrchestrationStatus, ProcessTimeouts, RunningAgent,
    StartOutcome,
};
use crate::broadcast::{AgentErrorNotice, AgentOutput, AgentStateChange, Hub, SseEvent};
use crate::config::AppConfig;
use crate::error::ManagerError;
use crate::model::{Agent, NewEvent, kind};
use crate::store::Store;

/// Longest excerpt of output or message content put into logs and events.
const PREVIEW_CHARS: usize = 200;

/// Everything the manager needs to build controllers.
#[derive(Clone, Debug)]
pub struct ManagerSettings {
    pub agency_dir: PathBuf,
    pub data_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub api_base: String,
    pub cli_command: String,
    pub timeouts: ProcessTimeouts,
    pub orchestration_interval: Duration,
}

impl From<&AppConfig> for ManagerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            agency_dir: config.agency_dir.clone(),
            data_dir: config.data_dir.clone(),
            projects_dir: config.projects_dir.clone(),
            api_base: config.api_base(),
            cli_command: config.cli_command.clone(),
            timeouts: config.timeouts(),
            orchestration_interval: Duration::from_millis(config.orchestration_interval_ms),
        }
    }
}

struct Entry {
    instance: u64,
    controller: AgentController,
}

struct Orchestration {
    interval: Duration,
    cancel: Option<CancellationToken>,
}

struct ManagerInner {
    settings: ManagerSettings,
    hub: Hub,
    spawner: Arc<dyn ProcessSpawner>,
    controllers: Mutex<HashMap<String, Entry>>,
    orchestration: Mutex<Orchestration>,
    next_instance: AtomicU64,
    /// Serializes orchestration cycles (timer and on-demand runs).
    pub(super) cycle_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<ManagerInner>,
}

impl AgentManager {
    pub fn new(settings: ManagerSettings, hub: Hub, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let interval = settings.orchestration_interval;
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                hub,
                spawner,
                controllers: Mutex::new(HashMap::new()),
                orchestration: Mutex::new(Orchestration {
                    interval,
                    cancel: None,
                }),
                next_instance: AtomicU64::new(1),
                cycle_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub(super) fn store(&self) -> &Store {
        self.inner.hub.store()
    }

    pub(super) fn cycle_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.inner.cycle_lock
    }

    // ─── Control API ───

    /// Start `name`, optionally on a task.
    ///
    /// Fails with [`ManagerError::UnknownAgent`] for a name not in the roster
    /// and [`ManagerError::AlreadyRunning`] if its controller is not idle or
    /// stopped.
    pub async fn start_agent(
        &self,
        name: &str,
        task_id: Option<&str>,
    ) -> Result<StartOutcome, ManagerError> {
        let agent = self
            .store()
            .agents()
            .get(name)?
            .ok_or_else(|| ManagerError::UnknownAgent(name.to_string()))?;
        if let Some(task_id) = task_id {
            self.store().tasks().require(task_id)?;
        }

        let (instance, controller) = {
            let mut controllers = self.inner.controllers.lock().unwrap();
            if let Some(existing) = controllers.get(name) {
                let state = existing.controller.state();
                if !state.is_startable() {
                    return Err(ManagerError::AlreadyRunning {
                        name: name.to_string(),
                        state,
                    });
                }
            }
            let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);
            let (controller, channels) = AgentController::new(
                self.controller_options(&agent),
                self.inner.hub.clone(),
                self.inner.spawner.clone(),
            );
            controller.reserve_start()?;
            controllers.insert(
                name.to_string(),
                Entry {
                    instance,
                    controller: controller.clone(),
                },
            );
            self.forward(name.to_string(), instance, channels);
            (instance, controller)
        };

        if let Err(e) = controller.launch(task_id).await {
            self.forget_if_settled(name, instance);
            return Err(e.into());
        }
        Ok(StartOutcome {
            pid: controller.pid(),
            session_id: controller.session_id(),
        })
    }

    /// Stop `name` and drop its controller once stopped.
    pub async fn stop_agent(&self, name: &str) -> Result<(), ManagerError> {
        let (instance, controller) = self.entry(name)?;
        controller.stop().await?;
        self.forget_if_settled(name, instance);
        Ok(())
    }

    pub fn pause_agent(&self, name: &str, reason: Option<&str>) -> Result<(), ManagerError> {
        let (_, controller) = self.entry(name)?;
        controller.pause(reason)?;
        Ok(())
    }

    pub fn resume_agent(&self, name: &str) -> Result<(), ManagerError> {
        let (_, controller) = self.entry(name)?;
        controller.resume()?;
        Ok(())
    }

    pub async fn inject_message(
        &self,
        name: &str,
        message: &str,
        injected_by: &str,
    ) -> Result<(), ManagerError> {
        let (_, controller) = self.entry(name)?;
        controller.inject(message, injected_by).await?;
        Ok(())
    }

    pub async fn redirect_agent(&self, name: &str, task_id: &str) -> Result<(), ManagerError> {
        let (_, controller) = self.entry(name)?;
        let task = self.store().tasks().require(task_id)?;
        let previous = controller.task_id();
        controller.redirect(task_id).await?;
        self.inner.hub.record_or_warn(
            NewEvent::new(kind::AGENT_REDIRECTED)
                .agent(name)
                .task(Some(task_id))
                .session(controller.session_id().as_deref())
                .data(json!({ "fromTaskId": previous, "toTaskId": task_id }))
                .message(format!("Agent {name} redirected to \"{}\"", task.title)),
        );
        Ok(())
    }

    // ─── Queries ───

    /// Running, paused or injecting. Starting and stopping do not count.
    pub fn is_running(&self, name: &str) -> bool {
        self.controller_state(name)
            .is_some_and(ControllerState::is_active)
    }

    /// Has a controller in any state other than idle or stopped.
    pub fn is_busy(&self, name: &str) -> bool {
        self.controller_state(name)
            .is_some_and(|state| !state.is_startable())
    }

    pub fn controller_state(&self, name: &str) -> Option<ControllerState> {
        let controllers = self.inner.controllers.lock().unwrap();
        controllers.get(name).map(|e| e.controller.state())
    }

    pub fn controller(&self, name: &str) -> Option<AgentController> {
        self.entry(name).ok().map(|(_, controller)| controller)
    }

    /// Snapshots of every registered controller, by name.
    pub fn running_agents(&self) -> Vec<RunningAgent> {
        let controllers: Vec<AgentController> = {
            let map = self.inner.controllers.lock().unwrap();
            map.values().map(|e| e.controller.clone()).collect()
        };
        let mut running: Vec<RunningAgent> = controllers.iter().map(|c| c.snapshot()).collect();
        running.sort_by(|a, b| a.name.cmp(&b.name));
        running
    }

    /// Stop every controller concurrently and clear the registry. Individual
    /// failures are logged, not returned.
    pub async fn stop_all(&self) {
        self.disable_auto_orchestration();
        let controllers: Vec<AgentController> = {
            let map = self.inner.controllers.lock().unwrap();
            map.values().map(|e| e.controller.clone()).collect()
        };
        let count = controllers.len();
        let results = futures::future::join_all(controllers.iter().map(|c| c.stop())).await;
        for (controller, result) in controllers.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(agent = %controller.name(), error = %e, "failed to stop agent");
            }
        }
        self.inner.controllers.lock().unwrap().clear();
        tracing::info!(count, "all agents stopped");
        self.inner.hub.record_or_warn(
            NewEvent::new(kind::SYSTEM_SHUTDOWN)
                .data(json!({ "stopped": count }))
                .message("All agents stopped"),
        );
    }

    // ─── Auto-orchestration ───

    /// Start the periodic cycle. The first cycle runs immediately. Enabling
    /// while enabled only restarts the timer if the interval changed.
    pub fn enable_auto_orchestration(&self, interval: Option<Duration>) -> OrchestrationStatus {
        let (interval, token) = {
            let mut orchestration = self.inner.orchestration.lock().unwrap();
            let interval = interval.unwrap_or(orchestration.interval);
            if orchestration.cancel.is_some() && interval == orchestration.interval {
                return OrchestrationStatus {
                    enabled: true,
                    interval_ms: interval.as_millis() as u64,
                };
            }
            if let Some(previous) = orchestration.cancel.take() {
                previous.cancel();
            }
            let token = CancellationToken::new();
            orchestration.interval = interval;
            orchestration.cancel = Some(token.clone());
            (interval, token)
        };

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.run_cycle().await;
                        tracing::debug!(
                            started = report.started.len(),
                            errors = report.errors.len(),
                            "orchestration cycle complete"
                        );
                    }
                }
            }
        });

        let interval_ms = interval.as_millis() as u64;
        tracing::info!(interval_ms, "auto-orchestration enabled");
        self.inner.hub.record_or_warn(
            NewEvent::new(kind::ORCHESTRATOR_ENABLED)
                .data(json!({ "intervalMs": interval_ms }))
                .message(format!("Auto-orchestration enabled ({interval_ms}ms)")),
        );
        OrchestrationStatus {
            enabled: true,
            interval_ms,
        }
    }

    pub fn disable_auto_orchestration(&self) -> OrchestrationStatus {
        let (was_enabled, interval) = {
            let mut orchestration = self.inner.orchestration.lock().unwrap();
            let token = orchestration.cancel.take();
            if let Some(token) = &token {
                token.cancel();
            }
            (token.is_some(), orchestration.interval)
        };
        if was_enabled {
            tracing::info!("auto-orchestration disabled");
            self.inner.hub.record_or_warn(
                NewEvent::new(kind::ORCHESTRATOR_DISABLED).message("Auto-orchestration disabled"),
            );
        }
        OrchestrationStatus {
            enabled: false,
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn orchestration_status(&self) -> OrchestrationStatus {
        let orchestration = self.inner.orchestration.lock().unwrap();
        OrchestrationStatus {
            enabled: orchestration.cancel.is_some(),
            interval_ms: orchestration.interval.as_millis() as u64,
        }
    }

    // ─── Internals ───

    fn entry(&self, name: &str) -> Result<(u64, AgentController), ManagerError> {
        let controllers = self.inner.controllers.lock().unwrap();
        controllers
            .get(name)
            .map(|e| (e.instance, e.controller.clone()))
            .ok_or_else(|| ManagerError::NotRunning(name.to_string()))
    }

    /// Drop the controller registered as `instance` if it has settled in
    /// idle or stopped. A newer controller under the same name is kept.
    fn forget_if_settled(&self, name: &str, instance: u64) {
        forget_if_settled(&self.inner, name, instance);
    }

    fn controller_options(&self, agent: &Agent) -> ControllerOptions {
        let settings = &self.inner.settings;
        ControllerOptions {
            agent_name: agent.name.clone(),
            agent_type: agent.agent_type,
            agency_dir: settings.agency_dir.clone(),
            data_dir: settings.data_dir.clone(),
            projects_dir: settings.projects_dir.clone(),
            api_base: settings.api_base.clone(),
            cli_command: settings.cli_command.clone(),
            timeouts: settings.timeouts,
        }
    }

    /// Relay a controller's notifications until its channels close.
    fn forward(&self, name: String, instance: u64, channels: ControllerChannels) {
        let hub = self.inner.hub.clone();
        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let ControllerChannels {
            mut lifecycle,
            mut output,
        } = channels;
        tokio::spawn(async move {
            let mut output_open = true;
            loop {
                tokio::select! {
                    biased;
                    event = lifecycle.recv() => match event {
                        Some(event) => {
                            let exited = matches!(event, ControllerEvent::Exit { .. });
                            relay(&hub, &name, event);
                            if exited && let Some(inner) = manager.upgrade() {
                                forget_if_settled(&inner, &name, instance);
                            }
                        }
                        None => break,
                    },
                    event = output.recv(), if output_open => match event {
                        Some(event) => relay(&hub, &name, event),
                        None => output_open = false,
                    },
                }
            }
            tracing::debug!(agent = %name, instance, "controller forwarder finished");
        });
    }
}

fn forget_if_settled(inner: &ManagerInner, name: &str, instance: u64) {
    let mut controllers = inner.controllers.lock().unwrap();
    let settled = controllers
        .get(name)
        .is_some_and(|e| e.instance == instance && e.controller.state().is_startable());
    if settled {
        controllers.remove(name);
        tracing::debug!(agent = %name, instance, "controller removed");
    }
}

/// Turn one controller notification into broadcasts and audit events.
fn relay(hub: &Hub, agent: &str, event: ControllerEvent) {
    match event {
        ControllerEvent::State { from, to } => hub.publish(SseEvent::AgentState {
            data: AgentStateChange {
                agent: agent.to_string(),
                from,
                to,
            },
        }),
        ControllerEvent::Output { chunk, events } => {
            tracing::debug!(agent = %agent, chunk = %preview(chunk.trim_end(), PREVIEW_CHARS), "agent output");
            hub.publish(SseEvent::AgentOutput {
                data: AgentOutput {
                    agent: agent.to_string(),
                    chunk,
                    events,
                },
            });
        }
        ControllerEvent::Message {
            session_id,
            message,
        } => hub.record_or_warn(
            NewEvent::new(kind::AGENT_MESSAGE)
                .agent(agent)
                .session(Some(&session_id))
                .data(json!({
                    "messageId": message.id,
                    "role": message.role,
                    "sequence": message.sequence,
                    "contentPreview": preview(&message.content, PREVIEW_CHARS),
                    "toolCalls": message.tool_calls.len(),
                })),
        ),
        ControllerEvent::ToolStart { id, name, .. } => hub.record_or_warn(
            NewEvent::new(kind::AGENT_TOOL_START)
                .agent(agent)
                .data(json!({ "toolId": id, "toolName": name })),
        ),
        ControllerEvent::ToolComplete {
            id,
            content,
            is_error,
        } => hub.record_or_warn(
            NewEvent::new(kind::AGENT_TOOL_COMPLETE)
                .agent(agent)
                .data(json!({
                    "toolId": id,
                    "isError": is_error,
                    "resultPreview": preview(&content, PREVIEW_CHARS),
                })),
        ),
        ControllerEvent::Error { message } => {
            tracing::warn!(agent = %agent, error = %message, "agent error");
            hub.record_or_warn(
                NewEvent::new(kind::AGENT_ERROR)
                    .agent(agent)
                    .message(message.clone()),
            );
            hub.publish(SseEvent::AgentError {
                data: AgentErrorNotice {
                    agent: agent.to_string(),
                    message,
                },
            });
        }
        ControllerEvent::Exit { .. } => {}
    }
}
