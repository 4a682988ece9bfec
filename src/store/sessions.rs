use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use super::{Store, from_millis, json_column, now_millis, opt_from_millis, pid_column, sql_limit};
use crate::error::StoreError;
use crate::model::{Message, MessageRole, NewMessage, Session, SessionStatus};

const SESSION_COLUMNS: &str = "id, agent_name, external_session_id, status, task_id, pid, \
     started_at, ended_at, input_tokens, output_tokens, exit_code, exit_reason";

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, tool_calls, tool_results, \
     injected, injected_by, sequence, created_at";

/// Session queries.
pub struct Sessions<'a> {
    store: &'a Store,
}

impl<'a> Sessions<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Open a RUNNING session for `agent`.
    pub fn create(
        &self,
        agent: &str,
        external_session_id: &str,
        task_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.store.conn().execute(
            "INSERT INTO agent_sessions (id, agent_name, external_session_id, status, task_id, started_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                agent,
                external_session_id,
                SessionStatus::Running,
                task_id,
                now_millis()
            ],
        )?;
        self.require(&id)
    }

    pub fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let session = self
            .store
            .conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM agent_sessions WHERE id = ?1"),
                params![id],
                map_session,
            )
            .optional()?;
        Ok(session)
    }

    pub fn require(&self, id: &str) -> Result<Session, StoreError> {
        self.get(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "session",
            id: id.to_string(),
        })
    }

    /// Newest first.
    pub fn list_for_agent(
        &self,
        agent: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Session>, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM agent_sessions WHERE agent_name = ?1 \
             ORDER BY started_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let sessions = stmt
            .query_map(params![agent, sql_limit(limit)], map_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Record the outcome of a session. Terminal statuses stamp `ended_at`.
    pub fn finish(
        &self,
        id: &str,
        status: SessionStatus,
        exit_code: Option<i32>,
        exit_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let ended_at = status.is_terminal().then(now_millis);
        self.store.conn().execute(
            "UPDATE agent_sessions SET status = ?1, exit_code = COALESCE(?2, exit_code), \
             exit_reason = COALESCE(?3, exit_reason), ended_at = COALESCE(ended_at, ?4) \
             WHERE id = ?5",
            params![status, exit_code, exit_reason, ended_at, id],
        )?;
        Ok(())
    }

    pub fn set_pid(&self, id: &str, pid: Option<u32>) -> Result<(), StoreError> {
        self.store.conn().execute(
            "UPDATE agent_sessions SET pid = ?1 WHERE id = ?2",
            params![pid.map(i64::from), id],
        )?;
        Ok(())
    }

    pub fn add_usage(&self, id: &str, input_tokens: u64, output_tokens: u64) -> Result<(), StoreError> {
        self.store.conn().execute(
            "UPDATE agent_sessions SET input_tokens = input_tokens + ?1, \
             output_tokens = output_tokens + ?2 WHERE id = ?3",
            params![input_tokens as i64, output_tokens as i64, id],
        )?;
        Ok(())
    }
}

/// Conversation message queries.
pub struct Messages<'a> {
    store: &'a Store,
}

impl<'a> Messages<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Append a message, numbering it after the session's last one.
    pub fn append(&self, input: &NewMessage) -> Result<Message, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let injected = input.injected_by.is_some() || input.role == MessageRole::Injected;
        let conn = self.store.conn();
        let sequence: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE session_id = ?1",
            params![input.session_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO messages (id, session_id, role, content, tool_calls, tool_results, \
             injected, injected_by, sequence, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                input.session_id,
                input.role,
                input.content,
                serde_json::to_string(&input.tool_calls)?,
                serde_json::to_string(&input.tool_results)?,
                injected,
                input.injected_by,
                sequence,
                now
            ],
        )?;
        Ok(Message {
            id,
            session_id: input.session_id.clone(),
            role: input.role,
            content: input.content.clone(),
            tool_calls: input.tool_calls.clone(),
            tool_results: input.tool_results.clone(),
            injected,
            injected_by: input.injected_by.clone(),
            sequence,
            created_at: from_millis(now),
        })
    }

    /// Messages in sequence order.
    pub fn list_for_session(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1 \
             ORDER BY sequence LIMIT ?2"
        ))?;
        let messages = stmt
            .query_map(params![session_id, sql_limit(limit)], map_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        external_session_id: row.get(2)?,
        status: row.get(3)?,
        task_id: row.get(4)?,
        pid: pid_column(row.get(5)?),
        started_at: from_millis(row.get(6)?),
        ended_at: opt_from_millis(row.get(7)?),
        input_tokens: row.get::<_, i64>(8)?.max(0) as u64,
        output_tokens: row.get::<_, i64>(9)?.max(0) as u64,
        exit_code: row.get(10)?,
        exit_reason: row.get(11)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        tool_calls: json_column(&row.get::<_, String>(4)?),
        tool_results: json_column(&row.get::<_, String>(5)?),
        injected: row.get(6)?,
        injected_by: row.get(7)?,
        sequence: row.get(8)?,
        created_at: from_millis(row.get(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolCall;

    #[test]
    fn finish_stamps_end_time_and_reason() {
        let store = Store::open_in_memory().unwrap();
        let session = store.sessions().create("qa", "ext-1", Some("t-1")).unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.ended_at.is_none());

        store
            .sessions()
            .finish(&session.id, SessionStatus::Failed, Some(1), Some("signal SIGKILL"))
            .unwrap();
        let finished = store.sessions().require(&session.id).unwrap();
        assert_eq!(finished.status, SessionStatus::Failed);
        assert_eq!(finished.exit_code, Some(1));
        assert_eq!(finished.exit_reason.as_deref(), Some("signal SIGKILL"));
        assert!(finished.ended_at.is_some());
    }

    #[test]
    fn usage_accumulates() {
        let store = Store::open_in_memory().unwrap();
        let session = store.sessions().create("qa", "ext-1", None).unwrap();
        store.sessions().add_usage(&session.id, 10, 5).unwrap();
        store.sessions().add_usage(&session.id, 1, 2).unwrap();
        let session = store.sessions().require(&session.id).unwrap();
        assert_eq!((session.input_tokens, session.output_tokens), (11, 7));
    }

    #[test]
    fn message_sequence_increases_per_session() {
        let store = Store::open_in_memory().unwrap();
        let a = store.sessions().create("qa", "ext-a", None).unwrap();
        let b = store.sessions().create("qa", "ext-b", None).unwrap();
        let first = store
            .messages()
            .append(&NewMessage::new(&a.id, MessageRole::User, "hello"))
            .unwrap();
        let mut reply = NewMessage::new(&a.id, MessageRole::Assistant, "on it");
        reply.tool_calls.push(ToolCall {
            id: "toolu_1".into(),
            name: "Bash".into(),
            input: serde_json::json!({"command": "ls"}),
        });
        let second = store.messages().append(&reply).unwrap();
        let other = store
            .messages()
            .append(&NewMessage::injected(&b.id, "stop", "operator"))
            .unwrap();
        assert_eq!((first.sequence, second.sequence, other.sequence), (1, 2, 1));
        assert!(other.injected);

        let listed = store.messages().list_for_session(&a.id, None).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].tool_calls[0].name, "Bash");
    }

    #[test]
    fn sessions_list_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let first = store.sessions().create("qa", "ext-1", None).unwrap();
        let second = store.sessions().create("qa", "ext-1", None).unwrap();
        let listed = store.sessions().list_for_agent("qa", None).unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }
}
