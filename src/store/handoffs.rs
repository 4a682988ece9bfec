use std::collections::HashMap;

use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};
use uuid::Uuid;

use super::{Store, from_millis, now_millis, opt_from_millis, sql_limit};
use crate::error::StoreError;
use crate::model::{Handoff, HandoffFilter, HandoffStatus, NewHandoff};

const COLUMNS: &str = "id, from_agent, to_agent, type, title, content, task_id, status, \
     claimed_by, priority, created_at, claimed_at, resolved_at";

const URGENCY_ORDER: &str = "CASE priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 \
     WHEN 'normal' THEN 2 ELSE 3 END, created_at DESC, rowid DESC";

/// Handoff queries.
pub struct Handoffs<'a> {
    store: &'a Store,
}

impl<'a> Handoffs<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(&self, input: &NewHandoff) -> Result<Handoff, StoreError> {
        if input.from_agent.trim().is_empty() {
            return Err(StoreError::Invalid("from_agent is required".into()));
        }
        if input.title.trim().is_empty() || input.content.trim().is_empty() {
            return Err(StoreError::Invalid("title and content are required".into()));
        }
        let id = Uuid::new_v4().to_string();
        self.store.conn().execute(
            "INSERT INTO handoffs (id, from_agent, to_agent, type, title, content, task_id, status, \
             priority, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                input.from_agent,
                input.to_agent,
                input.kind,
                input.title,
                input.content,
                input.task_id,
                HandoffStatus::Pending,
                input.priority.unwrap_or_default(),
                now_millis()
            ],
        )?;
        self.require(&id)
    }

    pub fn get(&self, id: &str) -> Result<Option<Handoff>, StoreError> {
        let handoff = self
            .store
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM handoffs WHERE id = ?1"),
                params![id],
                map_row,
            )
            .optional()?;
        Ok(handoff)
    }

    pub fn require(&self, id: &str) -> Result<Handoff, StoreError> {
        self.get(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "handoff",
            id: id.to_string(),
        })
    }

    /// Handoffs matching `filter`, most urgent first, then newest.
    ///
    /// A `to_agent` filter also matches handoffs addressed to nobody in particular.
    pub fn list(&self, filter: &HandoffFilter) -> Result<Vec<Handoff>, StoreError> {
        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(agent) = &filter.to_agent {
            clauses.push("(to_agent = ? OR to_agent IS NULL)");
            args.push(Value::Text(agent.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        args.push(Value::Integer(sql_limit(filter.limit)));

        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM handoffs {where_sql} ORDER BY {URGENCY_ORDER} LIMIT ?"
        ))?;
        let handoffs = stmt
            .query_map(params_from_iter(args.iter()), map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(handoffs)
    }

    /// Claim a PENDING handoff.
    pub fn claim(&self, id: &str, agent: &str) -> Result<Handoff, StoreError> {
        let now = now_millis();
        let changed = self.store.conn().execute(
            "UPDATE handoffs SET status = ?1, claimed_by = ?2, claimed_at = ?3 \
             WHERE id = ?4 AND status = 'PENDING'",
            params![HandoffStatus::Claimed, agent, now, id],
        )?;
        self.after_move(id, changed, HandoffStatus::Claimed)
    }

    /// Resolve a pending or claimed handoff.
    pub fn resolve(&self, id: &str) -> Result<Handoff, StoreError> {
        self.close(id, HandoffStatus::Resolved)
    }

    pub fn dismiss(&self, id: &str) -> Result<Handoff, StoreError> {
        self.close(id, HandoffStatus::Dismissed)
    }

    pub fn counts(&self) -> Result<HashMap<HandoffStatus, u64>, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM handoffs GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, HandoffStatus>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(counts)
    }

    fn close(&self, id: &str, to: HandoffStatus) -> Result<Handoff, StoreError> {
        let changed = self.store.conn().execute(
            "UPDATE handoffs SET status = ?1, resolved_at = ?2 \
             WHERE id = ?3 AND status IN ('PENDING', 'CLAIMED')",
            params![to, now_millis(), id],
        )?;
        self.after_move(id, changed, to)
    }

    fn after_move(&self, id: &str, changed: usize, to: HandoffStatus) -> Result<Handoff, StoreError> {
        let handoff = self.require(id)?;
        if changed == 0 {
            return Err(StoreError::InvalidTransition {
                entity: "handoff",
                id: id.to_string(),
                from: handoff.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(handoff)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Handoff> {
    Ok(Handoff {
        id: row.get(0)?,
        from_agent: row.get(1)?,
        to_agent: row.get(2)?,
        kind: row.get(3)?,
        title: row.get(4)?,
        content: row.get(5)?,
        task_id: row.get(6)?,
        status: row.get(7)?,
        claimed_by: row.get(8)?,
        priority: row.get(9)?,
        created_at: from_millis(row.get(10)?),
        claimed_at: opt_from_millis(row.get(11)?),
        resolved_at: opt_from_millis(row.get(12)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HandoffKind, HandoffPriority};

    fn new_handoff(to: Option<&str>, priority: Option<HandoffPriority>, title: &str) -> NewHandoff {
        NewHandoff {
            from_agent: "tech-lead".into(),
            to_agent: to.map(str::to_string),
            kind: HandoffKind::TaskHandoff,
            title: title.into(),
            content: "details".into(),
            task_id: None,
            priority,
        }
    }

    #[test]
    fn to_agent_filter_includes_broadcasts_and_orders_by_urgency() {
        let store = Store::open_in_memory().unwrap();
        let handoffs = store.handoffs();
        handoffs.create(&new_handoff(Some("qa"), None, "normal")).unwrap();
        handoffs
            .create(&new_handoff(None, Some(HandoffPriority::Urgent), "everyone"))
            .unwrap();
        handoffs
            .create(&new_handoff(Some("devops"), Some(HandoffPriority::High), "not mine"))
            .unwrap();

        let titles: Vec<_> = handoffs
            .list(&HandoffFilter {
                to_agent: Some("qa".into()),
                ..HandoffFilter::default()
            })
            .unwrap()
            .into_iter()
            .map(|h| h.title)
            .collect();
        assert_eq!(titles, vec!["everyone", "normal"]);
    }

    #[test]
    fn claim_only_from_pending() {
        let store = Store::open_in_memory().unwrap();
        let handoff = store.handoffs().create(&new_handoff(Some("qa"), None, "h")).unwrap();
        assert_eq!(handoff.priority, HandoffPriority::Normal);

        let claimed = store.handoffs().claim(&handoff.id, "qa").unwrap();
        assert_eq!(claimed.status, HandoffStatus::Claimed);
        assert_eq!(claimed.claimed_by.as_deref(), Some("qa"));
        assert!(matches!(
            store.handoffs().claim(&handoff.id, "devops").unwrap_err(),
            StoreError::InvalidTransition { .. }
        ));

        let resolved = store.handoffs().resolve(&handoff.id).unwrap();
        assert_eq!(resolved.status, HandoffStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
        assert!(store.handoffs().dismiss(&handoff.id).is_err());
        assert_eq!(store.handoffs().counts().unwrap()[&HandoffStatus::Resolved], 1);
    }

    #[test]
    fn create_requires_title_and_content() {
        let store = Store::open_in_memory().unwrap();
        let mut input = new_handoff(None, None, "");
        assert!(store.handoffs().create(&input).is_err());
        input.title = "ok".into();
        input.content = " ".into();
        assert!(store.handoffs().create(&input).is_err());
    }
}
