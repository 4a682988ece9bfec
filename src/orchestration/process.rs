//! Pseudo-terminal subprocess layer.
//!
//! The agent CLI only emits its structured stream under a TTY, so processes
//! are spawned on a PTY via `portable-pty`. The controller talks to them
//! through the narrow [`ProcessSpawner`] / [`ProcessHandle`] traits, which
//! keeps the state machine independent of the PTY mechanism and lets tests
//! substitute a scripted fake.
//!
//! The spawned process:
//! - Leads its own session and process group (portable-pty calls `setsid`),
//!   so signals go to the whole group via `killpg`
//! - Streams output as raw byte chunks over a bounded channel
//! - Reports its exit status exactly once over a oneshot channel

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot};

use crate::error::ProcessError;

/// Chunks buffered between the PTY reader thread and the controller.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

const READ_BUFFER_SIZE: usize = 8192;

/// Signals the controller sends to an agent process group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessSignal {
    Interrupt,
    Suspend,
    Continue,
    Kill,
}

impl ProcessSignal {
    pub fn name(self) -> &'static str {
        match self {
            ProcessSignal::Interrupt => "SIGINT",
            ProcessSignal::Suspend => "SIGSTOP",
            ProcessSignal::Continue => "SIGCONT",
            ProcessSignal::Kill => "SIGKILL",
        }
    }

    fn as_nix(self) -> Signal {
        match self {
            ProcessSignal::Interrupt => Signal::SIGINT,
            ProcessSignal::Suspend => Signal::SIGSTOP,
            ProcessSignal::Continue => Signal::SIGCONT,
            ProcessSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// What to run and where.
#[derive(Clone, Debug)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: PathBuf) -> Self {
        Self {
            program: program.into(),
            args,
            cwd,
            env: Vec::new(),
            cols: 120,
            rows: 30,
        }
    }
}

/// How a process ended. `signal` is set when it was killed by one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

/// Control surface of a running process.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;
    fn signal(&self, signal: ProcessSignal) -> Result<(), ProcessError>;
    fn write(&self, data: &[u8]) -> Result<(), ProcessError>;
}

/// A freshly spawned process: its handle, its output stream and its exit.
pub struct SpawnedProcess {
    pub handle: Arc<dyn ProcessHandle>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<ExitInfo>,
}

pub trait ProcessSpawner: Send + Sync {
    /// Spawn a process. Must be called from within a tokio runtime.
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, ProcessError>;
}

/// Production spawner backed by the platform's native PTY.
#[derive(Clone, Copy, Debug, Default)]
pub struct PtySpawner;

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, ProcessError> {
        // 1. Open the PTY pair.
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::Pty(e.to_string()))?;

        // 2. Build the command.
        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        // 3. Spawn on the slave side, then drop our copy of the slave so the
        //    reader sees EOF once the child is gone.
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ProcessError::SpawnFailed {
                program: request.program.clone(),
                message: e.to_string(),
            })?;
        drop(pair.slave);
        let pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::Pty(e.to_string()))?;

        // 4. Reader: blocking reads forwarded as byte chunks.
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    // EIO is how Linux reports a closed slave.
                    Err(e) => {
                        tracing::debug!(error = %e, "pty read ended");
                        break;
                    }
                }
            }
        });

        // 5. Waiter: reap the child and report how it ended.
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let info = match child.wait() {
                Ok(status) => exit_info(&status),
                Err(e) => {
                    tracing::warn!(error = %e, "waiting for agent process failed");
                    ExitInfo::default()
                }
            };
            let _ = exit_tx.send(info);
        });

        tracing::debug!(program = %request.program, pid = ?pid, "spawned pty process");

        Ok(SpawnedProcess {
            handle: Arc::new(PtyHandle {
                pid,
                writer: Mutex::new(writer),
                _master: Mutex::new(pair.master),
            }),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

/// portable-pty only exposes the terminating signal through `Display`.
fn exit_info(status: &portable_pty::ExitStatus) -> ExitInfo {
    if status.success() {
        return ExitInfo {
            code: Some(0),
            signal: None,
        };
    }
    let text = status.to_string();
    match text.strip_prefix("Terminated by ") {
        Some(signal) => ExitInfo {
            code: None,
            signal: Some(signal.to_string()),
        },
        None => ExitInfo {
            code: Some(status.exit_code() as i32),
            signal: None,
        },
    }
}

struct PtyHandle {
    pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    // Held so the PTY stays open for the life of the process.
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

impl ProcessHandle for PtyHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn signal(&self, sig: ProcessSignal) -> Result<(), ProcessError> {
        let pid = self.pid.ok_or(ProcessError::NoPid)?;
        signal_group(pid, sig)
    }

    fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        let mut writer = self.writer.lock().unwrap();
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| ProcessError::Write(e.to_string()))
    }
}

/// Signal the process group led by `pid`, falling back to the process alone.
pub fn signal_group(pid: u32, sig: ProcessSignal) -> Result<(), ProcessError> {
    let target = Pid::from_raw(pid as i32);
    signal::killpg(target, sig.as_nix())
        .or_else(|_| signal::kill(target, sig.as_nix()))
        .map_err(|e| ProcessError::Signal {
            signal: sig.name(),
            pid,
            message: e.to_string(),
        })
}
