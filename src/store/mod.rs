//! SQLite-backed persistence for tasks, agents, sessions, messages,
//! handoffs and the audit event log.
//!
//! A single [`rusqlite::Connection`] sits behind `Arc<Mutex<..>>`; [`Store`]
//! is cheap to clone and shared by the orchestrator and the HTTP handlers.
//! Each table has a borrowed accessor (`store.tasks()`, `store.agents()`, ...)
//! grouping its queries. Multi-statement operations that must be atomic
//! (claims, checked transitions, message sequencing) run under one lock guard.

mod agents;
mod events;
mod handoffs;
mod sessions;
mod tasks;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

use crate::error::StoreError;
use crate::model::{
    AgentStatus, AgentType, HandoffKind, HandoffPriority, HandoffStatus, MessageRole,
    ParseEnumError, Priority, SessionStatus, Size, TaskStatus,
};

pub use agents::{AgentCounts, Agents, WorkloadRow};
pub use events::Events;
pub use handoffs::Handoffs;
pub use sessions::{Messages, Sessions};
pub use tasks::{TaskCounts, Tasks};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'INBOX',
    priority TEXT NOT NULL DEFAULT 'P2',
    size TEXT NOT NULL DEFAULT 'M',
    assigned_to TEXT,
    claimed_at INTEGER,
    value_statement TEXT,
    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
    context TEXT,
    files_changed TEXT NOT NULL DEFAULT '[]',
    summary TEXT,
    review_required INTEGER NOT NULL DEFAULT 0,
    sort_order INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    shipped_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_assigned ON tasks(assigned_to);

CREATE TABLE IF NOT EXISTS agents (
    name TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    specialization TEXT,
    status TEXT NOT NULL DEFAULT 'OFFLINE',
    current_task_id TEXT,
    working_on TEXT,
    blocker TEXT,
    pid INTEGER,
    session_id TEXT,
    last_heartbeat INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_sessions (
    id TEXT PRIMARY KEY,
    agent_name TEXT NOT NULL,
    external_session_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'RUNNING',
    task_id TEXT,
    pid INTEGER,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    exit_code INTEGER,
    exit_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_agent ON agent_sessions(agent_name, started_at);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES agent_sessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tool_calls TEXT NOT NULL DEFAULT '[]',
    tool_results TEXT NOT NULL DEFAULT '[]',
    injected INTEGER NOT NULL DEFAULT 0,
    injected_by TEXT,
    sequence INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(session_id, sequence)
);

CREATE TABLE IF NOT EXISTS handoffs (
    id TEXT PRIMARY KEY,
    from_agent TEXT NOT NULL,
    to_agent TEXT,
    type TEXT NOT NULL DEFAULT 'general',
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    task_id TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    claimed_by TEXT,
    priority TEXT NOT NULL DEFAULT 'normal',
    created_at INTEGER NOT NULL,
    claimed_at INTEGER,
    resolved_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_handoffs_to ON handoffs(to_agent, status);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    agent_name TEXT,
    task_id TEXT,
    session_id TEXT,
    handoff_id TEXT,
    data TEXT NOT NULL DEFAULT '{}',
    message TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
"#;

/// Shared handle to the database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        tracing::info!(path = %path.display(), "opened store");
        Self::init(conn)
    }

    /// A private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    pub fn tasks(&self) -> Tasks<'_> {
        Tasks::new(self)
    }

    pub fn agents(&self) -> Agents<'_> {
        Agents::new(self)
    }

    pub fn sessions(&self) -> Sessions<'_> {
        Sessions::new(self)
    }

    pub fn messages(&self) -> Messages<'_> {
        Messages::new(self)
    }

    pub fn handoffs(&self) -> Handoffs<'_> {
        Handoffs::new(self)
    }

    pub fn events(&self) -> Events<'_> {
        Events::new(self)
    }
}

// ─── Column helpers ───

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Decode a JSON column, falling back to the type's default on bad data.
pub(crate) fn json_column<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

pub(crate) fn pid_column(raw: Option<i64>) -> Option<u32> {
    raw.and_then(|v| u32::try_from(v).ok())
}

/// `LIMIT` value for SQLite, where a negative limit means unbounded.
pub(crate) fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX))
}

/// Store closed string enums as their wire names.
macro_rules! sql_text_enum {
    ($($ty:ty),+ $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
            }
        }
    )+};
}

sql_text_enum!(
    TaskStatus,
    Priority,
    Size,
    AgentType,
    AgentStatus,
    SessionStatus,
    MessageRole,
    HandoffKind,
    HandoffStatus,
    HandoffPriority,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_dirs_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agency.db");
        {
            let store = Store::open(&path).unwrap();
            store.events().record(&crate::model::NewEvent::new("system.startup")).unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.events().list(None, None, None).unwrap().len(), 1);
    }

    #[test]
    fn millis_helpers_survive_garbage() {
        assert_eq!(from_millis(0).timestamp_millis(), 0);
        assert_eq!(pid_column(Some(-1)), None);
        assert_eq!(pid_column(Some(4242)), Some(4242));
        let parsed: Vec<String> = json_column("not json");
        assert!(parsed.is_empty());
        assert_eq!(sql_limit(None), -1);
    }
}
