#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

use agency::broadcast::Hub;
use agency::error::ProcessError;
use agency::model::{AgentType, RosterEntry, default_roster};
use agency::orchestration::controller::{AgentController, ControllerChannels, ControllerOptions};
use agency::orchestration::manager::{AgentManager, ManagerSettings};
use agency::orchestration::process::{
    ExitInfo, ProcessHandle, ProcessSignal, ProcessSpawner, SpawnRequest, SpawnedProcess,
};
use agency::orchestration::types::ProcessTimeouts;
use agency::store::Store;

// ─── Fake processes ───────────────────────────────────────────────────

/// How every process spawned by a [`FakeSpawner`] reacts to signals.
#[derive(Clone, Copy, Debug, Default)]
pub struct Behavior {
    pub ignore_interrupt: bool,
    pub ignore_kill: bool,
}

/// A scripted stand-in for an agent CLI process.
pub struct FakeProcess {
    pub pid: u32,
    pub request: SpawnRequest,
    behavior: Behavior,
    signals: Mutex<Vec<ProcessSignal>>,
    written: Mutex<Vec<u8>>,
    output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    exit: Mutex<Option<oneshot::Sender<ExitInfo>>>,
}

impl FakeProcess {
    /// Push one line of output, newline appended.
    pub fn emit(&self, line: &str) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            tx.try_send(format!("{line}\n").into_bytes())
                .expect("output channel full");
        }
    }

    /// Push raw bytes exactly as given.
    pub fn emit_raw(&self, data: &str) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            tx.try_send(data.as_bytes().to_vec())
                .expect("output channel full");
        }
    }

    /// Close the output stream and report `info` as the exit.
    pub fn finish(&self, info: ExitInfo) {
        self.output.lock().unwrap().take();
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(info);
        }
    }

    pub fn exit_with(&self, code: i32) {
        self.finish(ExitInfo {
            code: Some(code),
            signal: None,
        });
    }

    pub fn has_exited(&self) -> bool {
        self.exit.lock().unwrap().is_none()
    }

    pub fn signals(&self) -> Vec<ProcessSignal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn signal(&self, signal: ProcessSignal) -> Result<(), ProcessError> {
        self.signals.lock().unwrap().push(signal);
        match signal {
            ProcessSignal::Interrupt if !self.behavior.ignore_interrupt => self.finish(ExitInfo {
                code: Some(130),
                signal: None,
            }),
            ProcessSignal::Kill if !self.behavior.ignore_kill => self.finish(ExitInfo {
                code: None,
                signal: Some("SIGKILL".to_string()),
            }),
            _ => {}
        }
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }
}

/// Spawner that hands out [`FakeProcess`]es and remembers each of them.
#[derive(Default)]
pub struct FakeSpawner {
    behavior: Mutex<Behavior>,
    fail_next: Mutex<usize>,
    spawned: Mutex<Vec<Arc<FakeProcess>>>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_behavior(behavior: Behavior) -> Arc<Self> {
        let spawner = Self::default();
        *spawner.behavior.lock().unwrap() = behavior;
        Arc::new(spawner)
    }

    /// Make the next `count` spawns fail.
    pub fn fail_next(&self, count: usize) {
        *self.fail_next.lock().unwrap() = count;
    }

    pub fn spawned(&self) -> Vec<Arc<FakeProcess>> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakeProcess> {
        self.spawned
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("nothing spawned")
    }

    /// Processes whose `AGENCY_AGENT` is `name`, oldest first.
    pub fn for_agent(&self, name: &str) -> Vec<Arc<FakeProcess>> {
        self.spawned()
            .into_iter()
            .filter(|p| {
                p.request
                    .env
                    .iter()
                    .any(|(k, v)| k == "AGENCY_AGENT" && v == name)
            })
            .collect()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, ProcessError> {
        {
            let mut fail = self.fail_next.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(ProcessError::SpawnFailed {
                    program: request.program,
                    message: "scripted failure".to_string(),
                });
            }
        }

        let (output_tx, output_rx) = mpsc::channel(256);
        let (exit_tx, exit_rx) = oneshot::channel();
        let mut spawned = self.spawned.lock().unwrap();
        let process = Arc::new(FakeProcess {
            pid: 4000 + spawned.len() as u32,
            request,
            behavior: *self.behavior.lock().unwrap(),
            signals: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            output: Mutex::new(Some(output_tx)),
            exit: Mutex::new(Some(exit_tx)),
        });
        spawned.push(process.clone());
        Ok(SpawnedProcess {
            handle: process,
            output: output_rx,
            exit: exit_rx,
        })
    }
}

// ─── Fixtures ─────────────────────────────────────────────────────────

pub struct Fixture {
    pub dir: TempDir,
    pub hub: Hub,
    pub spawner: Arc<FakeSpawner>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_spawner(FakeSpawner::new())
    }

    pub fn with_spawner(spawner: Arc<FakeSpawner>) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let roster = default_roster();
        for entry in &roster {
            write_role(&agency_dir(dir.path()), &entry.name);
        }
        let store = Store::open_in_memory().expect("in-memory store");
        store.agents().seed(&roster).expect("seed roster");
        Self {
            dir,
            hub: Hub::new(store),
            spawner,
        }
    }

    pub fn store(&self) -> &Store {
        self.hub.store()
    }

    pub fn agency_dir(&self) -> std::path::PathBuf {
        agency_dir(self.dir.path())
    }

    pub fn settings(&self) -> ManagerSettings {
        let agency = self.agency_dir();
        ManagerSettings {
            data_dir: agency.join("data"),
            projects_dir: agency.join("projects"),
            agency_dir: agency,
            api_base: "http://localhost:3000/api".to_string(),
            cli_command: "claude".to_string(),
            timeouts: short_timeouts(),
            orchestration_interval: Duration::from_millis(50),
        }
    }

    pub fn manager(&self) -> AgentManager {
        AgentManager::new(self.settings(), self.hub.clone(), self.spawner.clone())
    }

    pub fn controller(&self, name: &str, agent_type: AgentType) -> (AgentController, ControllerChannels) {
        let settings = self.settings();
        let opts = ControllerOptions {
            agent_name: name.to_string(),
            agent_type,
            agency_dir: settings.agency_dir,
            data_dir: settings.data_dir,
            projects_dir: settings.projects_dir,
            api_base: settings.api_base,
            cli_command: settings.cli_command,
            timeouts: settings.timeouts,
        };
        AgentController::new(opts, self.hub.clone(), self.spawner.clone())
    }

    /// Add an agent to the roster without a role definition on disk.
    pub fn add_agent_without_role(&self, name: &str, agent_type: AgentType) {
        self.store()
            .agents()
            .seed(&[RosterEntry::new(name, agent_type)])
            .expect("seed agent");
    }
}

pub fn short_timeouts() -> ProcessTimeouts {
    ProcessTimeouts {
        inject_wait: Duration::from_millis(200),
        stop_grace: Duration::from_millis(200),
        stop_bound: Duration::from_millis(600),
        kill_settle: Duration::from_millis(100),
    }
}

fn agency_dir(root: &Path) -> std::path::PathBuf {
    root.join("agency")
}

fn write_role(agency_dir: &Path, name: &str) {
    let path = agency_dir.join("agents").join(name).join("AGENT.md");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, format!("# {name}\n\nYou are {name}.\n")).unwrap();
}

/// Poll `check` until it holds, panicking after two seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ─── Stream records ───────────────────────────────────────────────────

pub fn assistant_text(text: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "message": { "content": [{ "type": "text", "text": text }] }
    })
    .to_string()
}

pub fn assistant_tool_use(id: &str, name: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "message": { "content": [{ "type": "tool_use", "id": id, "name": name, "input": { "path": "src/main.rs" } }] }
    })
    .to_string()
}

pub fn turn_result(text: &str) -> String {
    serde_json::json!({
        "type": "result",
        "is_error": false,
        "result": text,
        "usage": { "input_tokens": 12, "output_tokens": 34 }
    })
    .to_string()
}
