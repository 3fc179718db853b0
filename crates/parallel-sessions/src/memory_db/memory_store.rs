//! Channel memory storage, including promotion to global knowledge on save.
use crate::error::{Error, Result};
use crate::memory_db::knowledge_store::KnowledgeStore;
use crate::memory_db::schema::*;
use crate::memory_db::{sql_limit, DbPool, PooledConn};
use crate::promotion;
use rusqlite::{params, Row, ToSql, TransactionBehavior};
use tracing::{debug, info};

pub struct ChannelMemoryStore {
    pool: DbPool,
}

impl ChannelMemoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<PooledConn> {
        Ok(self.pool.get()?)
    }

    /// Insert a memory and, when it clears `threshold`, its global knowledge
    /// row. Both writes share one immediate transaction.
    pub fn save(&self, entry: &NewChannelMemory, threshold: u8) -> Result<SavedMemory> {
        validate_new_memory(entry)?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let created_at = now();
        let promote = promotion::should_promote(entry.importance, threshold);

        tx.execute(
            "INSERT INTO channel_memory
             (session_key, channel_id, memory_type, content, importance, created_at, expires_at, promoted_to_global)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &entry.session_key,
                &entry.channel_id,
                &entry.memory_type,
                &entry.content,
                entry.importance,
                to_millis(created_at),
                entry.expires_at.map(to_millis),
                promote,
            ],
        )?;
        let id = tx.last_insert_rowid();

        let promoted_knowledge_id = if promote {
            Some(KnowledgeStore::promote_with_tx(&tx, id, entry, created_at)?)
        } else {
            None
        };

        tx.commit()?;

        debug!(
            "Saved channel memory {} for session {} (importance {}, promoted: {})",
            id,
            entry.session_key,
            entry.importance,
            promoted_knowledge_id.is_some()
        );
        Ok(SavedMemory { id, promoted_knowledge_id })
    }

    pub fn get(&self, id: i64) -> Result<Option<ChannelMemoryEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_MEMORY))?;
        let mut rows = stmt.query([id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(row_to_memory(row)?))
        } else {
            Ok(None)
        }
    }

    /// Memories matching `query`, most recent first.
    pub fn list(&self, query: &MemoryQuery) -> Result<Vec<ChannelMemoryEntry>> {
        let mut sql = format!("{} WHERE 1=1", SELECT_MEMORY);
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(channel_id) = &query.channel_id {
            sql.push_str(" AND channel_id = ?");
            values.push(Box::new(channel_id.clone()));
        }
        if let Some(session_key) = &query.session_key {
            sql.push_str(" AND session_key = ?");
            values.push(Box::new(session_key.clone()));
        }
        if !query.memory_types.is_empty() {
            let placeholders = vec!["?"; query.memory_types.len()].join(",");
            sql.push_str(&format!(" AND memory_type IN ({})", placeholders));
            for memory_type in &query.memory_types {
                values.push(Box::new(memory_type.clone()));
            }
        }
        if let Some(min_importance) = query.min_importance {
            sql.push_str(" AND importance >= ?");
            values.push(Box::new(min_importance));
        }
        if !query.include_expired {
            sql.push_str(" AND (expires_at IS NULL OR expires_at > ?)");
            values.push(Box::new(to_millis(now())));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        values.push(Box::new(sql_limit(query.limit)));

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let memories = stmt
            .query_map(rusqlite::params_from_iter(param_refs), row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(memories)
    }

    /// Case-insensitive substring search over unexpired memories.
    pub fn search(
        &self,
        needle: &str,
        channel_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChannelMemoryEntry>> {
        let conn = self.get_conn()?;
        let now_ms = to_millis(now());
        let limit = limit as i64;

        let mut sql = format!(
            "{} WHERE instr(lower(content), lower(?1)) > 0
               AND (expires_at IS NULL OR expires_at > ?2)",
            SELECT_MEMORY
        );
        let memories = match channel_id {
            Some(channel_id) => {
                sql.push_str(" AND channel_id = ?3 ORDER BY importance DESC, created_at DESC LIMIT ?4");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![needle, now_ms, channel_id, limit], row_to_memory)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                sql.push_str(" ORDER BY importance DESC, created_at DESC LIMIT ?3");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![needle, now_ms, limit], row_to_memory)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(memories)
    }

    /// Delete memories whose expiry has passed. Global knowledge is untouched.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM channel_memory WHERE expires_at IS NOT NULL AND expires_at < ?1",
            [to_millis(now())],
        )?;
        if deleted > 0 {
            info!("Removed {} expired channel memories", deleted);
        }
        Ok(deleted)
    }
}

const SELECT_MEMORY: &str = "SELECT id, session_key, channel_id, memory_type, content, importance,
        created_at, expires_at, promoted_to_global
 FROM channel_memory";

fn row_to_memory(row: &Row) -> rusqlite::Result<ChannelMemoryEntry> {
    Ok(ChannelMemoryEntry {
        id: row.get(0)?,
        session_key: row.get(1)?,
        channel_id: row.get(2)?,
        memory_type: row.get(3)?,
        content: row.get(4)?,
        importance: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        expires_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        promoted_to_global: row.get(8)?,
    })
}

fn validate_new_memory(entry: &NewChannelMemory) -> Result<()> {
    if entry.importance > promotion::MAX_IMPORTANCE {
        return Err(Error::InvalidInput(format!(
            "importance {} is outside 0..={}",
            entry.importance,
            promotion::MAX_IMPORTANCE
        )));
    }
    if entry.channel_id.trim().is_empty() {
        return Err(Error::InvalidInput("channel id cannot be empty".to_string()));
    }
    if entry.session_key.trim().is_empty() {
        return Err(Error::InvalidInput("session key cannot be empty".to_string()));
    }
    Ok(())
}
