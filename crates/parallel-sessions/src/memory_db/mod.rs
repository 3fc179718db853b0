//! Shared memory database - SQLite storage for channel memories, global
//! knowledge, hibernated sessions and work items.
pub mod knowledge_store;
pub mod memory_store;
pub mod migration;
pub mod schema;
pub mod session_store;
pub mod work_store;

pub use knowledge_store::KnowledgeStore;
pub use memory_store::ChannelMemoryStore;
pub use migration::MigrationManager;
pub use schema::*;
pub use session_store::SessionStore;
pub use work_store::WorkStore;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::promotion::DEFAULT_AUTO_PROMOTE_THRESHOLD;

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;
pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// `LIMIT -1` is unbounded in SQLite.
pub(crate) fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}

/// Connection settings for [`SharedMemoryBackend`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// `None` keeps everything in a private in-memory database.
    pub db_path: Option<PathBuf>,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
    pub enable_wal: bool,
    pub vacuum_on_startup: bool,
    pub auto_promote_threshold: u8,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            pool_size: 4,
            busy_timeout_ms: 5000,
            enable_wal: true,
            vacuum_on_startup: false,
            auto_promote_threshold: DEFAULT_AUTO_PROMOTE_THRESHOLD,
        }
    }
}

impl BackendConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }
}

/// Per-family stores sharing one pool. Present only while the backend is open.
struct Stores {
    memories: ChannelMemoryStore,
    knowledge: KnowledgeStore,
    sessions: SessionStore,
    work: WorkStore,
    pool: DbPool,
}

impl Stores {
    fn new(pool: DbPool) -> Self {
        Self {
            memories: ChannelMemoryStore::new(Arc::clone(&pool)),
            knowledge: KnowledgeStore::new(Arc::clone(&pool)),
            sessions: SessionStore::new(Arc::clone(&pool)),
            work: WorkStore::new(Arc::clone(&pool)),
            pool,
        }
    }
}

/// Durable store for every record family. Safe to share across tasks; each
/// call checks out its own pooled connection.
pub struct SharedMemoryBackend {
    config: BackendConfig,
    stores: ArcSwapOption<Stores>,
    lifecycle: Mutex<()>,
}

impl SharedMemoryBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            stores: ArcSwapOption::empty(),
            lifecycle: Mutex::new(()),
        }
    }

    /// Open (creating if needed) the database file and initialize it.
    pub fn open(path: &Path) -> Result<Self> {
        let backend = Self::new(BackendConfig::file(path));
        backend.initialize()?;
        Ok(backend)
    }

    pub fn open_in_memory() -> Result<Self> {
        let backend = Self::new(BackendConfig::in_memory());
        backend.initialize()?;
        Ok(backend)
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.stores.load().is_some()
    }

    /// Create the parent directory, open the pool and apply migrations.
    /// Calling it on an open backend does nothing.
    pub fn initialize(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_initialized() {
            debug!("Shared memory store already initialized");
            return Ok(());
        }

        let pool = self.open_pool()?;
        {
            let mut conn = pool.get()?;
            if self.config.enable_wal && self.config.db_path.is_some() {
                let mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                conn.pragma_update(None, "synchronous", "NORMAL")?;
                debug!("Journal mode: {}", mode);
            }

            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;

            if self.config.vacuum_on_startup {
                migration::run_maintenance(&mut conn)?;
            }
        }

        self.stores.store(Some(Arc::new(Stores::new(Arc::new(pool)))));
        info!("Shared memory store initialized at {}", self.location());
        Ok(())
    }

    fn open_pool(&self) -> Result<Pool<SqliteConnectionManager>> {
        let busy_timeout = Duration::from_millis(self.config.busy_timeout_ms);
        let (manager, max_size) = match &self.config.db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                (SqliteConnectionManager::file(path), self.config.pool_size.max(1))
            }
            // Every in-memory connection is its own database, so the pool holds one.
            None => (SqliteConnectionManager::memory(), 1),
        };

        let manager = manager.with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "foreign_keys", true)
        });

        Ok(Pool::builder().max_size(max_size).build(manager)?)
    }

    fn location(&self) -> String {
        match &self.config.db_path {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }

    /// Checkpoint the WAL and release the pool. Safe to call repeatedly.
    pub fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stores) = self.stores.swap(None) else {
            return Ok(());
        };

        if self.config.db_path.is_some() {
            let conn = stores.pool.get()?;
            if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
                warn!("WAL checkpoint on close failed: {}", e);
            }
        }
        info!("Shared memory store closed");
        Ok(())
    }

    fn stores(&self) -> Result<Arc<Stores>> {
        self.stores.load_full().ok_or(Error::NotInitialized)
    }

    // Channel memory and global knowledge

    /// Save a memory, promoting it with the configured threshold.
    pub fn save_channel_memory(&self, entry: &NewChannelMemory) -> Result<SavedMemory> {
        self.save_channel_memory_with_threshold(entry, self.config.auto_promote_threshold)
    }

    pub fn save_channel_memory_with_threshold(
        &self,
        entry: &NewChannelMemory,
        threshold: u8,
    ) -> Result<SavedMemory> {
        self.stores()?.memories.save(entry, threshold)
    }

    pub fn get_channel_memory(&self, id: i64) -> Result<Option<ChannelMemoryEntry>> {
        self.stores()?.memories.get(id)
    }

    pub fn get_channel_memories(&self, query: &MemoryQuery) -> Result<Vec<ChannelMemoryEntry>> {
        self.stores()?.memories.list(query)
    }

    pub fn get_global_knowledge(&self, query: &KnowledgeQuery) -> Result<Vec<GlobalKnowledgeEntry>> {
        self.stores()?.knowledge.list(query)
    }

    /// The knowledge row promoted from memory `memory_id`, if any.
    pub fn get_knowledge_for_memory(&self, memory_id: i64) -> Result<Option<GlobalKnowledgeEntry>> {
        self.stores()?.knowledge.get_by_source(memory_id)
    }

    /// Substring search over channel memories and/or global knowledge.
    /// Channel hits come first; each scope is capped at `options.limit`.
    pub fn search_memories(&self, query: &str, options: &SearchOptions) -> Result<Vec<MemorySearchHit>> {
        let stores = self.stores()?;
        let mut hits = Vec::new();

        if options.scope.includes_channel() {
            let memories = stores
                .memories
                .search(query, options.channel_id.as_deref(), options.limit)?;
            hits.extend(memories.into_iter().map(MemorySearchHit::Channel));
        }
        if options.scope.includes_global() {
            let knowledge = stores.knowledge.search(query, options.limit)?;
            hits.extend(knowledge.into_iter().map(MemorySearchHit::Global));
        }

        debug!("Search for {:?} returned {} hits", query, hits.len());
        Ok(hits)
    }

    pub fn cleanup_expired(&self) -> Result<usize> {
        self.stores()?.memories.cleanup_expired()
    }

    // Session state

    pub fn save_session_state(&self, state: &SessionState) -> Result<()> {
        self.stores()?.sessions.save(state)
    }

    pub fn save_session_states(&self, states: &[SessionState]) -> Result<usize> {
        self.stores()?.sessions.save_batch(states)
    }

    pub fn load_session_state(&self, session_key: &str) -> Result<Option<SessionState>> {
        self.stores()?.sessions.load(session_key)
    }

    pub fn delete_session_state(&self, session_key: &str) -> Result<bool> {
        self.stores()?.sessions.delete(session_key)
    }

    /// Load and delete in one statement.
    pub fn take_session_state(&self, session_key: &str) -> Result<Option<SessionState>> {
        self.stores()?.sessions.take(session_key)
    }

    pub fn list_session_states(&self) -> Result<Vec<SessionState>> {
        self.stores()?.sessions.list()
    }

    // Work items

    pub fn save_work_item(&self, item: &NewWorkItem) -> Result<WorkItem> {
        self.stores()?.work.insert(item)
    }

    pub fn get_work_item(&self, id: i64) -> Result<Option<WorkItem>> {
        self.stores()?.work.get(id)
    }

    pub fn get_work_items(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>> {
        self.stores()?.work.list(filter)
    }

    pub fn update_work_item(
        &self,
        id: i64,
        status: WorkStatus,
        patch: &WorkItemPatch,
    ) -> Result<Option<WorkItem>> {
        Ok(self.transition_work_item(id, status, patch)?.map(|(_, item)| item))
    }

    /// Like [`Self::update_work_item`], also returning the status the item left.
    pub fn transition_work_item(
        &self,
        id: i64,
        status: WorkStatus,
        patch: &WorkItemPatch,
    ) -> Result<Option<(WorkStatus, WorkItem)>> {
        self.stores()?.work.update(id, status, patch)
    }

    pub fn claim_work_items(&self, limit: usize) -> Result<Vec<WorkItem>> {
        self.stores()?.work.claim(limit)
    }

    pub fn cancel_work_item(&self, id: i64) -> Result<bool> {
        self.stores()?.work.cancel(id)
    }

    // Housekeeping

    pub fn get_stats(&self) -> Result<BackendStats> {
        let stores = self.stores()?;
        let conn = stores.pool.get()?;
        Ok(migration::get_backend_stats(&conn)?)
    }

    /// ANALYZE, incremental vacuum and an integrity check.
    pub fn run_maintenance(&self) -> Result<()> {
        let stores = self.stores()?;
        let mut conn = stores.pool.get()?;
        Ok(migration::run_maintenance(&mut conn)?)
    }
}

impl Drop for SharedMemoryBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close shared memory store: {}", e);
        }
    }
}
