use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;

use super::{Store, from_millis, now_millis, opt_from_millis, pid_column};
use crate::error::StoreError;
use crate::model::{Agent, AgentStatus, AgentType, RosterEntry};

const COLUMNS: &str = "name, type, specialization, status, current_task_id, working_on, blocker, \
     pid, session_id, last_heartbeat, created_at, updated_at";

/// Agent totals by status for the dashboard.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentCounts {
    pub total: u64,
    pub online: u64,
    pub working: u64,
    pub idle: u64,
    pub paused: u64,
    pub blocked: u64,
}

/// Per-agent load, joined against the task table.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadRow {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub working_on: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub active_tasks: u64,
    pub completed_tasks: u64,
}

/// Agent queries.
pub struct Agents<'a> {
    store: &'a Store,
}

impl<'a> Agents<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<Agent>, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM agents ORDER BY name"))?;
        let agents = stmt
            .query_map([], map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    pub fn get(&self, name: &str) -> Result<Option<Agent>, StoreError> {
        let agent = self
            .store
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM agents WHERE name = ?1"),
                params![name],
                map_row,
            )
            .optional()?;
        Ok(agent)
    }

    pub fn require(&self, name: &str) -> Result<Agent, StoreError> {
        self.get(name)?.ok_or_else(|| not_found(name))
    }

    /// Insert roster entries that are not in the table yet, as OFFLINE.
    /// Returns how many were added.
    pub fn seed(&self, roster: &[RosterEntry]) -> Result<usize, StoreError> {
        let now = now_millis();
        let conn = self.store.conn();
        let mut added = 0;
        for entry in roster {
            added += conn.execute(
                "INSERT OR IGNORE INTO agents (name, type, specialization, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    entry.name,
                    entry.agent_type,
                    entry.specialization,
                    AgentStatus::Offline,
                    now
                ],
            )?;
        }
        Ok(added)
    }

    /// Set status together with the working-on line and blocker text.
    pub fn update_status(
        &self,
        name: &str,
        status: AgentStatus,
        working_on: Option<&str>,
        blocker: Option<&str>,
    ) -> Result<Agent, StoreError> {
        let changed = self.store.conn().execute(
            "UPDATE agents SET status = ?1, working_on = ?2, blocker = ?3, updated_at = ?4 \
             WHERE name = ?5",
            params![status, working_on, blocker, now_millis(), name],
        )?;
        if changed == 0 {
            return Err(not_found(name));
        }
        self.require(name)
    }

    /// Point the agent at its live session, pid and task (or clear them).
    pub fn update_session(
        &self,
        name: &str,
        session_id: Option<&str>,
        pid: Option<u32>,
        task_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let changed = self.store.conn().execute(
            "UPDATE agents SET session_id = ?1, pid = ?2, current_task_id = ?3, updated_at = ?4 \
             WHERE name = ?5",
            params![session_id, pid.map(i64::from), task_id, now_millis(), name],
        )?;
        if changed == 0 {
            return Err(not_found(name));
        }
        Ok(())
    }

    pub fn heartbeat(&self, name: &str) -> Result<(), StoreError> {
        let now = now_millis();
        let changed = self.store.conn().execute(
            "UPDATE agents SET last_heartbeat = ?1, updated_at = ?1 WHERE name = ?2",
            params![now, name],
        )?;
        if changed == 0 {
            return Err(not_found(name));
        }
        Ok(())
    }

    pub fn counts(&self) -> Result<AgentCounts, StoreError> {
        let counts = self.store.conn().query_row(
            "SELECT COUNT(*), \
                    COALESCE(SUM(CASE WHEN status != 'OFFLINE' THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN status = 'WORKING' THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN status = 'IDLE' THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN status = 'PAUSED' THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN status = 'BLOCKED' THEN 1 ELSE 0 END), 0) \
             FROM agents",
            [],
            |row| {
                Ok(AgentCounts {
                    total: row.get::<_, i64>(0)? as u64,
                    online: row.get::<_, i64>(1)? as u64,
                    working: row.get::<_, i64>(2)? as u64,
                    idle: row.get::<_, i64>(3)? as u64,
                    paused: row.get::<_, i64>(4)? as u64,
                    blocked: row.get::<_, i64>(5)? as u64,
                })
            },
        )?;
        Ok(counts)
    }

    pub fn workload(&self) -> Result<Vec<WorkloadRow>, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT a.name, a.type, a.status, a.working_on, a.last_heartbeat, \
                    COALESCE(SUM(CASE WHEN t.status = 'IN_PROGRESS' THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN t.status = 'SHIPPED' THEN 1 ELSE 0 END), 0) \
             FROM agents a LEFT JOIN tasks t ON t.assigned_to = a.name \
             GROUP BY a.name ORDER BY a.name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(WorkloadRow {
                    name: row.get(0)?,
                    agent_type: row.get(1)?,
                    status: row.get(2)?,
                    working_on: row.get(3)?,
                    last_heartbeat: opt_from_millis(row.get(4)?),
                    active_tasks: row.get::<_, i64>(5)? as u64,
                    completed_tasks: row.get::<_, i64>(6)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn not_found(name: &str) -> StoreError {
    StoreError::NotFound {
        entity: "agent",
        id: name.to_string(),
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        name: row.get(0)?,
        agent_type: row.get(1)?,
        specialization: row.get(2)?,
        status: row.get(3)?,
        current_task_id: row.get(4)?,
        working_on: row.get(5)?,
        blocker: row.get(6)?,
        pid: pid_column(row.get(7)?),
        session_id: row.get(8)?,
        last_heartbeat: opt_from_millis(row.get(9)?),
        created_at: from_millis(row.get(10)?),
        updated_at: from_millis(row.get(11)?),
    })
}
