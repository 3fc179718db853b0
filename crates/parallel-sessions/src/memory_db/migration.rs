//! Database migration system

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{error, info, warn};

use crate::memory_db::schema::{self, BackendStats};

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Bring the database up to the latest schema version.
    pub fn initialize_database(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Shared memory schema version: {}", current_version);

        self.apply_migrations(current_version)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version <= current_version {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, schema::to_millis(schema::now())],
            )?;
            tx.commit()?;

            info!("Migration {} applied successfully", version);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
    }
}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_work_items.sql")),
        (3, include_str!("migrations/003_session_context.sql")),
    ]
}

pub fn latest_version() -> i32 {
    get_migrations().last().map(|(v, _)| *v).unwrap_or(0)
}

/// Read-only counters over every record family.
pub fn get_backend_stats(conn: &Connection) -> Result<BackendStats> {
    fn count(conn: &Connection, sql: &str) -> Result<i64> {
        conn.query_row(sql, [], |row| row.get(0))
    }

    Ok(BackendStats {
        channel_memory_count: count(conn, "SELECT COUNT(*) FROM channel_memory")?,
        global_knowledge_count: count(conn, "SELECT COUNT(*) FROM global_knowledge")?,
        executing_work_items: count(
            conn,
            "SELECT COUNT(*) FROM work_items WHERE status = 'executing'",
        )?,
        active_work_items: count(
            conn,
            "SELECT COUNT(*) FROM work_items WHERE status IN ('scheduled', 'ready', 'executing')",
        )?,
        hibernated_sessions: count(conn, "SELECT COUNT(*) FROM session_state")?,
        distinct_sessions: count(
            conn,
            "SELECT COUNT(*) FROM (
                 SELECT session_key FROM channel_memory
                 UNION SELECT session_key FROM work_items
                 UNION SELECT session_key FROM session_state
             )",
        )?,
    })
}

/// Run database maintenance tasks
pub fn run_maintenance(conn: &mut Connection) -> Result<()> {
    info!("Running shared memory maintenance...");
    conn.execute_batch("ANALYZE")?;
    conn.execute_batch("PRAGMA incremental_vacuum(100)")?;
    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if integrity != "ok" {
        warn!("Integrity check reported: {}", integrity);
    }
    info!("Shared memory maintenance completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();

        let migrator = MigrationManager::new(&mut conn);
        assert_eq!(migrator.get_current_version().unwrap(), latest_version());
        assert!(migrator.has_migration_applied(1).unwrap());
        assert!(migrator.has_migration_applied(2).unwrap());
        assert!(migrator.has_migration_applied(3).unwrap());
        assert!(!migrator.has_migration_applied(99).unwrap());

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 3);
    }

    #[test]
    fn stats_on_empty_database_are_zero() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        assert_eq!(get_backend_stats(&conn).unwrap(), BackendStats::default());
        run_maintenance(&mut conn).unwrap();
    }

    #[test]
    fn stats_fail_when_tables_are_missing() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(get_backend_stats(&conn).is_err());
    }
}
