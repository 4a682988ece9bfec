use std::path::PathBuf;

use crate::orchestration::types::ControllerState;

/// Errors related to configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Invalid input: {0}")]
    Invalid(String),
}

/// Errors from the pseudo-terminal process layer.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to open pseudo-terminal: {0}")]
    Pty(String),

    #[error("Failed to spawn `{program}`: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("Failed to deliver {signal} to pid {pid}: {message}")]
    Signal {
        signal: &'static str,
        pid: u32,
        message: String,
    },

    #[error("Process has no pid")]
    NoPid,

    #[error("Failed to write to process: {0}")]
    Write(String),
}

/// Errors from a single agent's process controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: ControllerState,
    },

    #[error("Role definition not found at {path}")]
    RoleDefinitionNotFound { path: PathBuf },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Errors from the agent manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Agent {name} is already running ({state})")]
    AlreadyRunning {
        name: String,
        state: ControllerState,
    },

    #[error("Agent {0} is not running")]
    NotRunning(String),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
