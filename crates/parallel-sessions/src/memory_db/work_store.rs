//! Work item persistence and the atomic claim used by executors.
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::memory_db::schema::*;
use crate::memory_db::{sql_limit, DbPool, PooledConn};

pub struct WorkStore {
    pool: DbPool,
}

impl WorkStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<PooledConn> {
        Ok(self.pool.get()?)
    }

    pub fn insert(&self, item: &NewWorkItem) -> Result<WorkItem> {
        if item.channel_id.trim().is_empty() {
            return Err(Error::InvalidInput("channel id cannot be empty".to_string()));
        }
        if item.max_attempts < 1 {
            return Err(Error::InvalidInput(format!(
                "max_attempts must be at least 1, got {}",
                item.max_attempts
            )));
        }

        let conn = self.get_conn()?;
        let created_at = to_millis(now());
        let payload = serde_json::to_string(&item.payload)?;

        conn.execute(
            "INSERT INTO work_items
             (session_key, channel_id, description, payload, priority, status, scheduled_for,
              attempts, max_attempts, progress_pct, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, 0, ?9, ?9)",
            params![
                &item.session_key,
                &item.channel_id,
                &item.description,
                payload,
                item.priority,
                item.status.as_str(),
                item.scheduled_for.map(to_millis),
                item.max_attempts,
                created_at,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Saved work item {} ({}) for {}", id, item.status, item.session_key);

        Self::get_with_conn(&conn, id)?
            .ok_or(Error::StoreUnavailable(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn get(&self, id: i64) -> Result<Option<WorkItem>> {
        let conn = self.get_conn()?;
        Self::get_with_conn(&conn, id)
    }

    fn get_with_conn(conn: &Connection, id: i64) -> Result<Option<WorkItem>> {
        let raw = conn
            .query_row(&format!("{} WHERE id = ?1", select_work()), [id], RawWorkItem::from_row)
            .optional()?;
        raw.map(RawWorkItem::into_item).transpose()
    }

    /// Items matching `filter`, highest priority first, then oldest.
    pub fn list(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>> {
        let mut sql = format!("{} WHERE 1=1", select_work());
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(session_key) = &filter.session_key {
            sql.push_str(" AND session_key = ?");
            values.push(Box::new(session_key.clone()));
        }
        if let Some(channel_id) = &filter.channel_id {
            sql.push_str(" AND channel_id = ?");
            values.push(Box::new(channel_id.clone()));
        }
        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(",");
            sql.push_str(&format!(" AND status IN ({})", placeholders));
            for status in &filter.statuses {
                values.push(Box::new(status.as_str()));
            }
        }
        sql.push_str(" ORDER BY priority DESC, created_at ASC, id ASC LIMIT ?");
        values.push(Box::new(sql_limit(filter.limit)));

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(param_refs))?;

        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(RawWorkItem::from_row(row)?.into_item()?);
        }
        Ok(items)
    }

    /// Move an item to `status`, applying `patch`, after checking the move is
    /// legal. Returns the status it left and the updated item, or `None` for
    /// an unknown id.
    pub fn update(
        &self,
        id: i64,
        status: WorkStatus,
        patch: &WorkItemPatch,
    ) -> Result<Option<(WorkStatus, WorkItem)>> {
        if let Some(pct) = patch.progress_pct {
            if pct > 100 {
                return Err(Error::InvalidInput(format!("progress {} is outside 0..=100", pct)));
            }
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = match Self::get_with_conn(&tx, id)? {
            Some(item) => item,
            None => return Ok(None),
        };

        let is_retry = patch.attempts.is_some_and(|a| a > current.attempts);
        if !current.status.can_transition_to(status, is_retry) {
            return Err(Error::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }

        let now_ms = to_millis(now());
        let started_at = if status == WorkStatus::Executing && current.status != WorkStatus::Executing {
            Some(now_ms)
        } else {
            current.started_at.map(to_millis)
        };
        let completed_at = if status.is_terminal() {
            Some(now_ms)
        } else {
            None
        };

        tx.execute(
            "UPDATE work_items SET
                 status = ?1,
                 attempts = COALESCE(?2, attempts),
                 progress_pct = COALESCE(?3, progress_pct),
                 result_summary = COALESCE(?4, result_summary),
                 started_at = ?5,
                 completed_at = ?6,
                 updated_at = ?7
             WHERE id = ?8",
            params![
                status.as_str(),
                patch.attempts,
                patch.progress_pct,
                &patch.result_summary,
                started_at,
                completed_at,
                now_ms,
                id,
            ],
        )?;
        let updated = Self::get_with_conn(&tx, id)?;
        tx.commit()?;

        debug!("Work item {} moved {} -> {}", id, current.status, status);
        Ok(updated.map(|item| (current.status, item)))
    }

    /// Promote due scheduled items, then hand out up to `limit` ready items as
    /// executing. The whole claim is one immediate transaction.
    pub fn claim(&self, limit: usize) -> Result<Vec<WorkItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_ms = to_millis(now());

        let promoted = tx.execute(
            "UPDATE work_items SET status = 'ready', updated_at = ?1
             WHERE status = 'scheduled' AND COALESCE(scheduled_for, 0) <= ?1",
            [now_ms],
        )?;

        let mut claimed = {
            let mut stmt = tx.prepare(&format!(
                "UPDATE work_items SET status = 'executing', started_at = ?1, updated_at = ?1
                 WHERE id IN (
                     SELECT id FROM work_items WHERE status = 'ready'
                     ORDER BY priority DESC, created_at ASC, id ASC
                     LIMIT ?2
                 )
                 RETURNING {}",
                WORK_COLUMNS
            ))?;
            let mut rows = stmt.query(params![now_ms, limit as i64])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(RawWorkItem::from_row(row)?.into_item()?);
            }
            items
        };
        tx.commit()?;

        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        if promoted > 0 || !claimed.is_empty() {
            info!(
                "Claimed {} work items ({} scheduled items became ready)",
                claimed.len(),
                promoted
            );
        }
        Ok(claimed)
    }

    /// Cancel an item that has not started. Returns whether anything changed.
    pub fn cancel(&self, id: i64) -> Result<bool> {
        let conn = self.get_conn()?;
        let now_ms = to_millis(now());
        let changed = conn.execute(
            "UPDATE work_items SET status = 'cancelled', completed_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status IN ('scheduled', 'ready')",
            params![now_ms, id],
        )?;
        Ok(changed > 0)
    }
}

const WORK_COLUMNS: &str = "id, session_key, channel_id, description, payload, priority, status,
        scheduled_for, attempts, max_attempts, progress_pct, result_summary,
        created_at, updated_at, started_at, completed_at";

fn select_work() -> String {
    format!("SELECT {} FROM work_items", WORK_COLUMNS)
}

/// Row image before payload JSON and status are parsed.
struct RawWorkItem {
    id: i64,
    session_key: String,
    channel_id: String,
    description: String,
    payload: String,
    priority: i64,
    status: String,
    scheduled_for: Option<i64>,
    attempts: i64,
    max_attempts: i64,
    progress_pct: u8,
    result_summary: Option<String>,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl RawWorkItem {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_key: row.get(1)?,
            channel_id: row.get(2)?,
            description: row.get(3)?,
            payload: row.get(4)?,
            priority: row.get(5)?,
            status: row.get(6)?,
            scheduled_for: row.get(7)?,
            attempts: row.get(8)?,
            max_attempts: row.get(9)?,
            progress_pct: row.get(10)?,
            result_summary: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
        })
    }

    fn into_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: self.id,
            session_key: self.session_key,
            channel_id: self.channel_id,
            description: self.description,
            payload: serde_json::from_str(&self.payload)?,
            priority: self.priority,
            status: self.status.parse()?,
            scheduled_for: self.scheduled_for.map(from_millis),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            progress_pct: self.progress_pct,
            result_summary: self.result_summary,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            started_at: self.started_at.map(from_millis),
            completed_at: self.completed_at.map(from_millis),
        })
    }
}
