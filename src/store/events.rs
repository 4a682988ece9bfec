use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Row, params, params_from_iter};
use serde_json::json;

use super::{Store, from_millis, now_millis, sql_limit};
use crate::error::StoreError;
use crate::model::{Event, EventRefs, NewEvent};

const COLUMNS: &str =
    "id, type, agent_name, task_id, session_id, handoff_id, data, message, created_at";

/// Append-only audit log.
pub struct Events<'a> {
    store: &'a Store,
}

impl<'a> Events<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn record(&self, event: &NewEvent) -> Result<Event, StoreError> {
        let now = now_millis();
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO events (type, agent_name, task_id, session_id, handoff_id, data, message, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.kind,
                event.refs.agent_name,
                event.refs.task_id,
                event.refs.session_id,
                event.refs.handoff_id,
                serde_json::to_string(&event.data)?,
                event.message,
                now
            ],
        )?;
        Ok(Event {
            id: conn.last_insert_rowid(),
            kind: event.kind.clone(),
            refs: event.refs.clone(),
            data: event.data.clone(),
            message: event.message.clone(),
            created_at: from_millis(now),
        })
    }

    /// Newest first, optionally narrowed to one kind and a start time.
    pub fn list(
        &self,
        kind: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(kind) = kind {
            clauses.push("type = ?");
            args.push(Value::Text(kind.to_string()));
        }
        if let Some(since) = since {
            clauses.push("created_at >= ?");
            args.push(Value::Integer(since.timestamp_millis()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        args.push(Value::Integer(sql_limit(limit)));

        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM events {where_sql} ORDER BY created_at DESC, id DESC LIMIT ?"
        ))?;
        let events = stmt
            .query_map(params_from_iter(args.iter()), map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let data: String = row.get(6)?;
    Ok(Event {
        id: row.get(0)?,
        kind: row.get(1)?,
        refs: EventRefs {
            agent_name: row.get(2)?,
            task_id: row.get(3)?,
            session_id: row.get(4)?,
            handoff_id: row.get(5)?,
        },
        data: serde_json::from_str(&data).unwrap_or_else(|_| json!({})),
        message: row.get(7)?,
        created_at: from_millis(row.get(8)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::kind;

    #[test]
    fn list_is_newest_first_and_filters_by_kind() {
        let store = Store::open_in_memory().unwrap();
        let events = store.events();
        events.record(&NewEvent::new(kind::SYSTEM_STARTUP)).unwrap();
        events
            .record(
                &NewEvent::new(kind::AGENT_STARTED)
                    .agent("qa")
                    .data(json!({"pid": 42}))
                    .message("Agent qa started"),
            )
            .unwrap();
        events.record(&NewEvent::new("custom.script_ran")).unwrap();

        let all = events.list(None, None, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].kind, "custom.script_ran");

        let started = events.list(Some(kind::AGENT_STARTED), None, Some(10)).unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].refs.agent_name.as_deref(), Some("qa"));
        assert_eq!(started[0].data["pid"], 42);

        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(events.list(None, Some(future), None).unwrap().is_empty());
    }
}
