//! Persisted state of hibernated sessions, keyed by session key.
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::error::Result;
use crate::memory_db::schema::*;
use crate::memory_db::{DbPool, PooledConn};

pub struct SessionStore {
    pool: DbPool,
}

impl SessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<PooledConn> {
        Ok(self.pool.get()?)
    }

    /// Upsert one session row. Saving the same key twice keeps one row.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        let conn = self.get_conn()?;
        Self::save_with_conn(&conn, state)?;
        debug!("Persisted session state for {}", state.session_key);
        Ok(())
    }

    /// Upsert many rows in one transaction; either all land or none do.
    pub fn save_batch(&self, states: &[SessionState]) -> Result<usize> {
        if states.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for state in states {
            Self::save_with_conn(&tx, state)?;
        }
        tx.commit()?;

        info!("Persisted {} session states", states.len());
        Ok(states.len())
    }

    fn save_with_conn(conn: &Connection, state: &SessionState) -> Result<()> {
        let context_json = state.context.as_ref().map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT OR REPLACE INTO session_state
             (session_key, channel_id, chat_id, peer_id, agent_id, status, message_count,
              created_at, last_activity_at, context_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &state.session_key,
                &state.channel_id,
                &state.chat_id,
                &state.peer_id,
                &state.agent_id,
                state.status.as_str(),
                state.message_count,
                to_millis(state.created_at),
                to_millis(state.last_activity_at),
                context_json,
            ],
        )?;
        Ok(())
    }

    pub fn load(&self, session_key: &str) -> Result<Option<SessionState>> {
        let conn = self.get_conn()?;
        let state = conn
            .query_row(
                &format!("{} WHERE session_key = ?1", SELECT_SESSION),
                [session_key],
                RawSession::from_row,
            )
            .optional()?;
        state.map(RawSession::into_state).transpose()
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, session_key: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM session_state WHERE session_key = ?1", [session_key])?;
        Ok(deleted > 0)
    }

    /// Read and remove a row in one statement, so two resumers cannot both
    /// receive the same state.
    pub fn take(&self, session_key: &str) -> Result<Option<SessionState>> {
        let conn = self.get_conn()?;
        let state = conn
            .query_row(
                "DELETE FROM session_state WHERE session_key = ?1
                 RETURNING session_key, channel_id, chat_id, peer_id, agent_id, status,
                           message_count, created_at, last_activity_at, context_json",
                [session_key],
                RawSession::from_row,
            )
            .optional()?;
        state.map(RawSession::into_state).transpose()
    }

    /// Every persisted session, most recently active first.
    pub fn list(&self) -> Result<Vec<SessionState>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY last_activity_at DESC", SELECT_SESSION))?;
        let mut rows = stmt.query([])?;

        let mut states = Vec::new();
        while let Some(row) = rows.next()? {
            states.push(RawSession::from_row(row)?.into_state()?);
        }
        Ok(states)
    }
}

const SELECT_SESSION: &str = "SELECT session_key, channel_id, chat_id, peer_id, agent_id, status,
        message_count, created_at, last_activity_at, context_json
 FROM session_state";

/// Row image before the status string is parsed.
struct RawSession {
    session_key: String,
    channel_id: String,
    chat_id: Option<String>,
    peer_id: Option<String>,
    agent_id: String,
    status: String,
    message_count: i64,
    created_at: i64,
    last_activity_at: i64,
    context_json: Option<String>,
}

impl RawSession {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            session_key: row.get(0)?,
            channel_id: row.get(1)?,
            chat_id: row.get(2)?,
            peer_id: row.get(3)?,
            agent_id: row.get(4)?,
            status: row.get(5)?,
            message_count: row.get(6)?,
            created_at: row.get(7)?,
            last_activity_at: row.get(8)?,
            context_json: row.get(9)?,
        })
    }

    fn into_state(self) -> Result<SessionState> {
        let context = self
            .context_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(SessionState {
            session_key: self.session_key,
            channel_id: self.channel_id,
            chat_id: self.chat_id,
            peer_id: self.peer_id,
            agent_id: self.agent_id,
            status: self.status.parse()?,
            message_count: self.message_count,
            created_at: from_millis(self.created_at),
            last_activity_at: from_millis(self.last_activity_at),
            context,
        })
    }
}
