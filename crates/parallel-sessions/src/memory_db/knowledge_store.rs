//! Global knowledge: memories promoted out of their channel.
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, ToSql};

use crate::error::Result;
use crate::memory_db::schema::*;
use crate::memory_db::{sql_limit, DbPool, PooledConn};
use crate::promotion;

pub struct KnowledgeStore {
    pool: DbPool,
}

impl KnowledgeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<PooledConn> {
        Ok(self.pool.get()?)
    }

    /// Insert the knowledge row for a freshly saved memory inside the caller's
    /// transaction. The memory type becomes the category.
    pub(crate) fn promote_with_tx(
        conn: &Connection,
        memory_id: i64,
        memory: &NewChannelMemory,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO global_knowledge
             (category, content, confidence, source_channel, source_session_key, source_memory_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &memory.memory_type,
                &memory.content,
                promotion::confidence_for(memory.importance),
                &memory.channel_id,
                &memory.session_key,
                memory_id,
                to_millis(created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Knowledge ordered by confidence, newest first among equals.
    pub fn list(&self, query: &KnowledgeQuery) -> Result<Vec<GlobalKnowledgeEntry>> {
        let mut sql = format!("{} WHERE 1=1", SELECT_KNOWLEDGE);
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(category) = &query.category {
            sql.push_str(" AND category = ?");
            values.push(Box::new(category.clone()));
        }
        if let Some(min_confidence) = query.min_confidence {
            sql.push_str(" AND confidence >= ?");
            values.push(Box::new(min_confidence));
        }
        sql.push_str(" ORDER BY confidence DESC, created_at DESC, id DESC LIMIT ?");
        values.push(Box::new(sql_limit(query.limit)));

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(param_refs))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(row_to_knowledge(row)?);
        }
        Ok(entries)
    }

    pub fn get_by_source(&self, memory_id: i64) -> Result<Option<GlobalKnowledgeEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE source_memory_id = ?1", SELECT_KNOWLEDGE))?;
        let mut rows = stmt.query([memory_id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(row_to_knowledge(row)?))
        } else {
            Ok(None)
        }
    }

    /// Case-insensitive substring search, highest confidence first.
    pub fn search(&self, needle: &str, limit: usize) -> Result<Vec<GlobalKnowledgeEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE instr(lower(content), lower(?1)) > 0
             ORDER BY confidence DESC, created_at DESC LIMIT ?2",
            SELECT_KNOWLEDGE
        ))?;
        let entries = stmt
            .query_map(params![needle, limit as i64], row_to_knowledge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

const SELECT_KNOWLEDGE: &str = "SELECT id, category, content, confidence, source_channel,
        source_session_key, source_memory_id, created_at
 FROM global_knowledge";

fn row_to_knowledge(row: &Row) -> rusqlite::Result<GlobalKnowledgeEntry> {
    Ok(GlobalKnowledgeEntry {
        id: row.get(0)?,
        category: row.get(1)?,
        content: row.get(2)?,
        confidence: row.get(3)?,
        source_channel: row.get(4)?,
        source_session_key: row.get(5)?,
        source_memory_id: row.get(6)?,
        created_at: from_millis(row.get(7)?),
    })
}
