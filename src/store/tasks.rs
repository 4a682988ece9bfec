use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use uuid::Uuid;

use super::{Store, from_millis, json_column, now_millis, opt_from_millis, sql_limit};
use crate::error::StoreError;
use crate::model::{NewTask, Priority, Size, Task, TaskFilter, TaskStatus, TaskUpdate};

const COLUMNS: &str = "id, title, description, status, priority, size, assigned_to, claimed_at, \
     value_statement, acceptance_criteria, context, files_changed, summary, review_required, \
     sort_order, created_at, updated_at, completed_at, shipped_at";

const PRIORITY_ORDER: &str = "CASE priority WHEN 'P0' THEN 0 WHEN 'P1' THEN 1 WHEN 'P2' THEN 2 ELSE 3 END, \
     sort_order, created_at, rowid";

/// Counts used by the dashboard summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskCounts {
    pub total: u64,
    pub by_status: HashMap<TaskStatus, u64>,
    pub shipped_today: u64,
}

/// Task queries.
pub struct Tasks<'a> {
    store: &'a Store,
}

impl<'a> Tasks<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(&self, input: &NewTask) -> Result<Task, StoreError> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(StoreError::Invalid("title is required".into()));
        }
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO tasks (id, title, description, status, priority, size, value_statement, \
             acceptance_criteria, context, review_required, sort_order, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                id,
                title,
                input.description,
                input.status.unwrap_or(TaskStatus::Inbox),
                input.priority.unwrap_or_default(),
                input.size.unwrap_or_default(),
                input.value_statement,
                serde_json::to_string(&input.acceptance_criteria)?,
                input.context,
                input.review_required,
                input.sort_order.unwrap_or(0),
                now,
            ],
        )?;
        require(&conn, &id)
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(fetch(&self.store.conn(), id)?)
    }

    pub fn require(&self, id: &str) -> Result<Task, StoreError> {
        require(&self.store.conn(), id)
    }

    /// Tasks matching `filter`, ordered P0..P3, then sort order, then age.
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let (where_sql, mut args) = filter_clause(filter);
        args.push(Value::Integer(sql_limit(filter.limit)));
        args.push(Value::Integer(filter.offset.unwrap_or(0) as i64));

        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM tasks {where_sql} ORDER BY {PRIORITY_ORDER} LIMIT ? OFFSET ?"
        ))?;
        let tasks = stmt
            .query_map(params_from_iter(args.iter()), map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Number of tasks matching `filter`, ignoring its limit and offset.
    pub fn count(&self, filter: &TaskFilter) -> Result<u64, StoreError> {
        let (where_sql, args) = filter_clause(filter);
        let count: i64 = self.store.conn().query_row(
            &format!("SELECT COUNT(*) FROM tasks {where_sql}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Apply the fields set in `update`, leaving the rest untouched.
    pub fn update(&self, id: &str, update: &TaskUpdate) -> Result<Task, StoreError> {
        let mut sets = vec!["updated_at = ?".to_string()];
        let mut args: Vec<Value> = vec![Value::Integer(now_millis())];
        let mut set = |column: &str, value: Value| {
            sets.push(format!("{column} = ?"));
            args.push(value);
        };
        if let Some(title) = &update.title {
            if title.trim().is_empty() {
                return Err(StoreError::Invalid("title cannot be empty".into()));
            }
            set("title", Value::Text(title.trim().to_string()));
        }
        if let Some(v) = &update.description {
            set("description", Value::Text(v.clone()));
        }
        if let Some(v) = update.priority {
            set("priority", Value::Text(v.as_str().to_string()));
        }
        if let Some(v) = update.size {
            set("size", Value::Text(v.as_str().to_string()));
        }
        if let Some(v) = &update.value_statement {
            set("value_statement", Value::Text(v.clone()));
        }
        if let Some(v) = &update.acceptance_criteria {
            set("acceptance_criteria", Value::Text(serde_json::to_string(v)?));
        }
        if let Some(v) = &update.context {
            set("context", Value::Text(v.clone()));
        }
        if let Some(v) = update.review_required {
            set("review_required", Value::Integer(v as i64));
        }
        if let Some(v) = update.sort_order {
            set("sort_order", Value::Integer(v));
        }
        if let Some(v) = &update.assigned_to {
            set("assigned_to", Value::Text(v.clone()));
        }
        args.push(Value::Text(id.to_string()));

        let conn = self.store.conn();
        let changed = conn.execute(
            &format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", ")),
            params_from_iter(args.iter()),
        )?;
        if changed == 0 {
            return Err(not_found(id));
        }
        require(&conn, id)
    }

    /// Claim a READY (or QA_FAILED) task for `agent`, moving it to IN_PROGRESS.
    pub fn claim(&self, id: &str, agent: &str) -> Result<Task, StoreError> {
        let now = now_millis();
        let conn = self.store.conn();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, assigned_to = ?2, claimed_at = ?3, updated_at = ?3 \
             WHERE id = ?4 AND status IN ('READY', 'QA_FAILED')",
            params![TaskStatus::InProgress, agent, now, id],
        )?;
        if changed == 0 {
            let current = require(&conn, id)?;
            return Err(invalid_move(id, current.status, TaskStatus::InProgress));
        }
        require(&conn, id)
    }

    /// Mark an IN_PROGRESS task DONE with a summary and the files it touched.
    pub fn complete(
        &self,
        id: &str,
        summary: Option<&str>,
        files_changed: &[String],
    ) -> Result<Task, StoreError> {
        let now = now_millis();
        let conn = self.store.conn();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, summary = ?2, files_changed = ?3, completed_at = ?4, \
             updated_at = ?4 WHERE id = ?5 AND status = 'IN_PROGRESS'",
            params![
                TaskStatus::Done,
                summary,
                serde_json::to_string(files_changed)?,
                now,
                id
            ],
        )?;
        if changed == 0 {
            let current = require(&conn, id)?;
            return Err(invalid_move(id, current.status, TaskStatus::Done));
        }
        require(&conn, id)
    }

    /// Move a task along the checked workflow.
    pub fn transition(&self, id: &str, to: TaskStatus) -> Result<Task, StoreError> {
        let conn = self.store.conn();
        let current = require(&conn, id)?;
        if !current.status.can_transition_to(to) {
            return Err(invalid_move(id, current.status, to));
        }
        write_status(&conn, id, to)?;
        require(&conn, id)
    }

    /// Force a status without consulting the workflow.
    pub fn set_status(&self, id: &str, to: TaskStatus) -> Result<Task, StoreError> {
        let conn = self.store.conn();
        if write_status(&conn, id, to)? == 0 {
            return Err(not_found(id));
        }
        require(&conn, id)
    }

    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self
            .store
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn count_in(&self, status: TaskStatus) -> Result<u64, StoreError> {
        let count: i64 = self.store.conn().query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Totals per status plus tasks shipped at or after `shipped_since`.
    pub fn counts(&self, shipped_since: DateTime<Utc>) -> Result<TaskCounts, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, TaskStatus>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut counts = TaskCounts::default();
        for (status, n) in rows {
            counts.total += n as u64;
            counts.by_status.insert(status, n as u64);
        }
        let shipped: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'SHIPPED' AND shipped_at >= ?1",
            params![shipped_since.timestamp_millis()],
            |row| row.get(0),
        )?;
        counts.shipped_today = shipped as u64;
        Ok(counts)
    }

    /// The task that has waited longest in `status`.
    pub fn oldest_in(&self, status: TaskStatus) -> Result<Option<Task>, StoreError> {
        let conn = self.store.conn();
        let task = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM tasks WHERE status = ?1 \
                     ORDER BY updated_at ASC, rowid ASC LIMIT 1"
                ),
                params![status],
                map_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Most recently touched tasks in any of `statuses`.
    pub fn recent_in(
        &self,
        statuses: &[TaskStatus],
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let marks = vec!["?"; statuses.len()].join(", ");
        let mut args: Vec<Value> = statuses
            .iter()
            .map(|s| Value::Text(s.as_str().to_string()))
            .collect();
        args.push(Value::Integer(sql_limit(Some(limit))));
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE status IN ({marks}) \
             ORDER BY updated_at DESC, rowid DESC LIMIT ?"
        ))?;
        let tasks = stmt
            .query_map(params_from_iter(args.iter()), map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }
}

fn filter_clause(filter: &TaskFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut args: Vec<Value> = Vec::new();
    if !filter.statuses.is_empty() {
        let marks = vec!["?"; filter.statuses.len()].join(", ");
        clauses.push(format!("status IN ({marks})"));
        args.extend(
            filter
                .statuses
                .iter()
                .map(|s| Value::Text(s.as_str().to_string())),
        );
    }
    if let Some(agent) = &filter.assigned_to {
        clauses.push("assigned_to = ?".to_string());
        args.push(Value::Text(agent.clone()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (where_sql, args)
}

fn fetch(conn: &Connection, id: &str) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        map_row,
    )
    .optional()
}

fn require(conn: &Connection, id: &str) -> Result<Task, StoreError> {
    fetch(conn, id)?.ok_or_else(|| not_found(id))
}

/// Write `to`, stamping completion and shipping times on the way.
fn write_status(conn: &Connection, id: &str, to: TaskStatus) -> Result<usize, StoreError> {
    let now = now_millis();
    let changed = conn.execute(
        "UPDATE tasks SET status = ?1, updated_at = ?2, \
         completed_at = CASE WHEN ?1 = 'DONE' THEN COALESCE(completed_at, ?2) ELSE completed_at END, \
         shipped_at = CASE WHEN ?1 = 'SHIPPED' THEN ?2 ELSE shipped_at END \
         WHERE id = ?3",
        params![to, now, id],
    )?;
    Ok(changed)
}

fn not_found(id: &str) -> StoreError {
    StoreError::NotFound {
        entity: "task",
        id: id.to_string(),
    }
}

fn invalid_move(id: &str, from: TaskStatus, to: TaskStatus) -> StoreError {
    StoreError::InvalidTransition {
        entity: "task",
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        priority: row.get::<_, Priority>(4)?,
        size: row.get::<_, Size>(5)?,
        assigned_to: row.get(6)?,
        claimed_at: opt_from_millis(row.get(7)?),
        value_statement: row.get(8)?,
        acceptance_criteria: json_column(&row.get::<_, String>(9)?),
        context: row.get(10)?,
        files_changed: json_column(&row.get::<_, String>(11)?),
        summary: row.get(12)?,
        review_required: row.get(13)?,
        sort_order: row.get(14)?,
        created_at: from_millis(row.get(15)?),
        updated_at: from_millis(row.get(16)?),
        completed_at: opt_from_millis(row.get(17)?),
        shipped_at: opt_from_millis(row.get(18)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn ready(store: &Store, title: &str, priority: Priority) -> Task {
        store
            .tasks()
            .create(&NewTask {
                status: Some(TaskStatus::Ready),
                priority: Some(priority),
                ..NewTask::titled(title)
            })
            .unwrap()
    }

    #[test]
    fn create_applies_defaults() {
        let store = store();
        let task = store.tasks().create(&NewTask::titled("  Fix login bug ")).unwrap();
        assert_eq!(task.title, "Fix login bug");
        assert_eq!(task.status, TaskStatus::Inbox);
        assert_eq!(task.priority, Priority::P2);
        assert_eq!(task.size, Size::M);
        assert!(task.assigned_to.is_none());
    }

    #[test]
    fn create_rejects_blank_title() {
        let err = store().tasks().create(&NewTask::titled("   ")).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn list_orders_by_priority_then_sort_order() {
        let store = store();
        ready(&store, "low", Priority::P3);
        ready(&store, "urgent", Priority::P0);
        ready(&store, "normal", Priority::P2);
        let titles: Vec<_> = store
            .tasks()
            .list(&TaskFilter::status(TaskStatus::Ready))
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["urgent", "normal", "low"]);
    }

    #[test]
    fn list_respects_limit_and_assignee() {
        let store = store();
        let a = ready(&store, "a", Priority::P1);
        ready(&store, "b", Priority::P1);
        store.tasks().claim(&a.id, "dev-alpha").unwrap();
        let mine = store
            .tasks()
            .list(&TaskFilter {
                assigned_to: Some("dev-alpha".into()),
                ..TaskFilter::default()
            })
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(store.tasks().list(&TaskFilter::default().limit(1)).unwrap().len(), 1);
        assert_eq!(store.tasks().count(&TaskFilter::default().limit(1)).unwrap(), 2);
        assert_eq!(store.tasks().count(&TaskFilter::status(TaskStatus::Ready)).unwrap(), 1);
    }

    #[test]
    fn claim_only_from_ready_or_qa_failed() {
        let store = store();
        let inbox = store.tasks().create(&NewTask::titled("triage me")).unwrap();
        let err = store.tasks().claim(&inbox.id, "dev-alpha").unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let task = ready(&store, "claim me", Priority::P1);
        let claimed = store.tasks().claim(&task.id, "dev-alpha").unwrap();
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.assigned_to.as_deref(), Some("dev-alpha"));
        assert!(claimed.claimed_at.is_some());

        // A second claim loses.
        assert!(store.tasks().claim(&task.id, "dev-beta").is_err());
        assert!(matches!(
            store.tasks().claim("missing", "dev-beta").unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[test]
    fn complete_records_summary_and_files() {
        let store = store();
        let task = ready(&store, "work", Priority::P1);
        store.tasks().claim(&task.id, "dev-alpha").unwrap();
        let done = store
            .tasks()
            .complete(&task.id, Some("Fixed race condition"), &["src/auth.rs".into()])
            .unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.summary.as_deref(), Some("Fixed race condition"));
        assert_eq!(done.files_changed, vec!["src/auth.rs".to_string()]);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn transition_is_checked_but_set_status_is_not() {
        let store = store();
        let task = store.tasks().create(&NewTask::titled("t")).unwrap();
        assert!(store.tasks().transition(&task.id, TaskStatus::Shipped).is_err());
        let shipped = store.tasks().set_status(&task.id, TaskStatus::Shipped).unwrap();
        assert_eq!(shipped.status, TaskStatus::Shipped);
        assert!(shipped.shipped_at.is_some());
        let counts = store.tasks().counts(Utc::now() - chrono::Duration::hours(24)).unwrap();
        assert_eq!(counts.shipped_today, 1);
        assert_eq!(counts.total, 1);
    }

    #[test]
    fn update_changes_only_given_fields() {
        let store = store();
        let task = store.tasks().create(&NewTask::titled("t")).unwrap();
        let updated = store
            .tasks()
            .update(
                &task.id,
                &TaskUpdate {
                    priority: Some(Priority::P0),
                    acceptance_criteria: Some(vec!["works".into()]),
                    ..TaskUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title, "t");
        assert_eq!(updated.priority, Priority::P0);
        assert_eq!(updated.acceptance_criteria, vec!["works".to_string()]);
    }
}
