//! Admission controller for resident sessions.
//!
//! At most `max_concurrent` sessions are resident. Admitting one more
//! hibernates the least recently active resident to the store first; asking for
//! a hibernated session brings it back the same way. The resident map lock is
//! held across the whole check, evict, resume or create sequence.

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ParallelSessionsConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, HibernateReason, SessionEvent};
use crate::memory_db::{
    now, BackendStats, KnowledgeQuery, MemoryQuery, MemorySearchHit, NewChannelMemory, SavedMemory,
    SearchOptions, SessionState, SessionStatus, SharedMemoryBackend, WorkItem, WorkItemFilter,
    WorkItemPatch, WorkStatus,
};
use crate::metrics;
use crate::sessions::briefing::render_briefing;
use crate::sessions::isolation::{derive_session_key, SessionRequest};
use crate::sessions::registry::ResidentSet;
use crate::work_queue::{ScheduleWorkParams, WorkQueue};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub session_key: String,
    /// True only when the session did not exist resident or hibernated.
    pub is_new: bool,
}

#[derive(Debug, Clone)]
pub struct SaveMemoryParams {
    pub session_key: String,
    pub channel_id: String,
    pub memory_type: String,
    pub content: String,
    pub importance: u8,
    /// Overrides `memory.default_ttl_ms` when set.
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStats {
    #[serde(flatten)]
    pub store: BackendStats,
    pub active_sessions: usize,
    /// Brand-new sessions created by this manager since it started.
    pub total_sessions: u64,
}

pub struct ParallelSessionManager {
    config: ParallelSessionsConfig,
    backend: Arc<SharedMemoryBackend>,
    resident: Mutex<ResidentSet>,
    work: WorkQueue,
    events: EventBus,
    total_created: AtomicU64,
    maintenance: StdMutex<Option<JoinHandle<()>>>,
}

impl ParallelSessionManager {
    /// Open the configured database and start the maintenance task when
    /// `enabled` is set.
    pub async fn initialize(config: ParallelSessionsConfig) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;

        let backend = SharedMemoryBackend::new(config.backend_config());
        backend.initialize()?;

        let manager = Self::with_backend(config, Arc::new(backend));
        manager.start_maintenance();
        Ok(manager)
    }

    /// Build a manager over an already initialized store. No background task
    /// is started.
    pub fn with_backend(config: ParallelSessionsConfig, backend: Arc<SharedMemoryBackend>) -> Arc<Self> {
        let events = EventBus::default();
        info!(
            "Parallel session manager ready (max {} resident, isolation {})",
            config.max_concurrent, config.isolation
        );
        Arc::new(Self {
            resident: Mutex::new(ResidentSet::new(config.max_concurrent)),
            work: WorkQueue::new(Arc::clone(&backend), events.clone()),
            events,
            backend,
            config,
            total_created: AtomicU64::new(0),
            maintenance: StdMutex::new(None),
        })
    }

    pub fn config(&self) -> &ParallelSessionsConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<SharedMemoryBackend> {
        &self.backend
    }

    pub fn work_queue(&self) -> &WorkQueue {
        &self.work
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // Sessions

    pub async fn get_or_create_session(&self, request: SessionRequest) -> Result<SessionHandle> {
        if request.channel_id.trim().is_empty() {
            return Err(Error::InvalidInput("channel id cannot be empty".to_string()));
        }
        let session_key = derive_session_key(self.config.isolation, &request);

        let mut resident = self.resident.lock().await;

        if resident.touch(&session_key) {
            debug!("Session {} already resident", session_key);
            return Ok(SessionHandle { session_key, is_new: false });
        }

        if resident.is_full() {
            self.evict_least_recent(&mut resident)?;
        }

        if let Some(mut state) = self.backend.take_session_state(&session_key)? {
            state.status = SessionStatus::Active;
            state.last_activity_at = now();
            let channel_id = state.channel_id.clone();
            resident.insert(state);
            metrics::inc_session_transition("reactivated");
            metrics::set_resident_sessions(resident.len());

            info!("Reactivated session {}", session_key);
            self.events.publish(SessionEvent::SessionReactivated {
                session_key: session_key.clone(),
                channel_id,
            });
            return Ok(SessionHandle { session_key, is_new: false });
        }

        let at = now();
        resident.insert(SessionState {
            session_key: session_key.clone(),
            channel_id: request.channel_id.clone(),
            chat_id: request.chat_id.clone(),
            peer_id: request.peer_id.clone(),
            agent_id: request.agent().to_string(),
            status: SessionStatus::Active,
            message_count: 0,
            created_at: at,
            last_activity_at: at,
            context: None,
        });
        self.total_created.fetch_add(1, Ordering::Relaxed);
        metrics::inc_session_transition("created");
        metrics::set_resident_sessions(resident.len());

        info!("Created session {}", session_key);
        self.events.publish(SessionEvent::SessionCreated {
            session_key: session_key.clone(),
            channel_id: request.channel_id,
        });
        Ok(SessionHandle { session_key, is_new: true })
    }

    /// Persist the least recently active resident and drop it from the map.
    /// If the write fails the victim stays resident.
    fn evict_least_recent(&self, resident: &mut ResidentSet) -> Result<()> {
        let Some(victim) = resident.lru_victim() else {
            return Ok(());
        };
        self.persist_and_remove(resident, &victim, HibernateReason::Capacity)?;
        Ok(())
    }

    fn persist_and_remove(
        &self,
        resident: &mut ResidentSet,
        session_key: &str,
        reason: HibernateReason,
    ) -> Result<bool> {
        let Some(mut state) = resident.get(session_key).cloned() else {
            return Ok(false);
        };
        state.status = SessionStatus::Hibernated;

        if let Err(e) = self.backend.save_session_state(&state) {
            warn!("Failed to hibernate session {}: {}", session_key, e);
            return Err(e);
        }
        resident.remove(session_key);
        metrics::inc_session_transition("hibernated");
        metrics::set_resident_sessions(resident.len());

        info!("Hibernated session {} ({:?})", session_key, reason);
        self.events.publish(SessionEvent::SessionHibernated {
            session_key: session_key.to_string(),
            channel_id: state.channel_id,
            reason,
        });
        Ok(true)
    }

    /// Persist and release a resident session. `false` if it was not resident.
    pub async fn hibernate_session(&self, session_key: &str) -> Result<bool> {
        let mut resident = self.resident.lock().await;
        self.persist_and_remove(&mut resident, session_key, HibernateReason::Explicit)
    }

    /// Touch a resident session and count one more message for it.
    pub async fn record_activity(&self, session_key: &str) -> bool {
        self.resident.lock().await.record_message(session_key)
    }

    /// Attach host context to a resident session. It is saved with the
    /// session on hibernation and restored on resume.
    pub async fn set_session_context(&self, session_key: &str, context: serde_json::Value) -> bool {
        self.resident.lock().await.set_context(session_key, Some(context))
    }

    /// Resident sessions, most recently active first.
    pub async fn active_sessions(&self) -> Vec<SessionState> {
        self.resident.lock().await.snapshot()
    }

    /// Report sessions that crossed `idle_timeout_ms` since the last sweep.
    /// Their status is not changed.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let timeout_ms = i64::try_from(self.config.idle_timeout_ms).unwrap_or(i64::MAX);
        let idle = self.resident.lock().await.take_newly_idle(timeout_ms);

        for (session_key, idle_ms) in &idle {
            debug!("Session {} idle for {}ms", session_key, idle_ms);
            self.events.publish(SessionEvent::SessionIdle {
                session_key: session_key.clone(),
                idle_ms: *idle_ms,
            });
        }
        idle.into_iter().map(|(key, _)| key).collect()
    }

    /// Stop maintenance and persist every resident session in one transaction.
    /// On failure nothing is removed from the resident set.
    pub async fn shutdown(&self) -> Result<usize> {
        self.stop_maintenance();

        let mut resident = self.resident.lock().await;
        let mut states = resident.snapshot();
        for state in &mut states {
            state.status = SessionStatus::Hibernated;
        }
        self.backend.save_session_states(&states)?;

        resident.drain();
        metrics::set_resident_sessions(0);
        for state in &states {
            metrics::inc_session_transition("hibernated");
            self.events.publish(SessionEvent::SessionHibernated {
                session_key: state.session_key.clone(),
                channel_id: state.channel_id.clone(),
                reason: HibernateReason::Shutdown,
            });
        }

        info!("Parallel session manager shut down, {} sessions hibernated", states.len());
        self.events.publish(SessionEvent::Shutdown {
            persisted_sessions: states.len(),
        });
        Ok(states.len())
    }

    // Memory

    pub async fn save_memory(&self, params: SaveMemoryParams) -> Result<SavedMemory> {
        let expires_at = params.expires_at.or_else(|| match self.config.memory.default_ttl_ms {
            0 => None,
            ttl => i64::try_from(ttl)
                .ok()
                .map(|ms| now() + ChronoDuration::milliseconds(ms)),
        });

        let entry = NewChannelMemory {
            session_key: params.session_key,
            channel_id: params.channel_id,
            memory_type: params.memory_type,
            content: params.content,
            importance: params.importance,
            expires_at,
        };
        let saved = self
            .backend
            .save_channel_memory_with_threshold(&entry, self.config.memory.auto_promote_threshold)?;

        self.resident.lock().await.touch(&entry.session_key);
        metrics::inc_memory_saved(saved.promoted());

        self.events.publish(SessionEvent::MemorySaved {
            session_key: entry.session_key.clone(),
            memory_id: saved.id,
            importance: entry.importance,
        });
        if let Some(knowledge_id) = saved.promoted_knowledge_id {
            info!("Memory {} promoted to global knowledge {}", saved.id, knowledge_id);
            self.events.publish(SessionEvent::KnowledgePromoted {
                knowledge_id,
                memory_id: saved.id,
                source_channel: entry.channel_id,
            });
        }
        Ok(saved)
    }

    pub fn search_memory(&self, query: &str, options: &SearchOptions) -> Result<Vec<MemorySearchHit>> {
        self.backend.search_memories(query, options)
    }

    /// Context block for a session built from the store. Unknown sessions get
    /// an empty string.
    pub async fn generate_briefing(&self, session_key: &str) -> Result<String> {
        let resident_channel = self
            .resident
            .lock()
            .await
            .get(session_key)
            .map(|s| s.channel_id.clone());
        let channel_id = match resident_channel {
            Some(channel_id) => channel_id,
            None => match self.backend.load_session_state(session_key)? {
                Some(state) => state.channel_id,
                None => return Ok(String::new()),
            },
        };

        let limits = &self.config.briefing;
        let global = self.backend.get_global_knowledge(&KnowledgeQuery {
            category: None,
            min_confidence: Some(limits.min_confidence),
            limit: Some(limits.max_global_knowledge),
        })?;
        let channel = self.backend.get_channel_memories(&MemoryQuery {
            channel_id: Some(channel_id),
            min_importance: Some(limits.min_importance),
            limit: Some(limits.max_channel_memories),
            ..Default::default()
        })?;
        let work = self.backend.get_work_items(&WorkItemFilter {
            session_key: Some(session_key.to_string()),
            statuses: WorkStatus::NON_TERMINAL.to_vec(),
            limit: Some(limits.max_work_items),
            ..Default::default()
        })?;

        Ok(render_briefing(&global, &channel, &work))
    }

    // Work

    pub fn schedule_work(&self, params: ScheduleWorkParams) -> Result<WorkItem> {
        self.work.schedule_work(params)
    }

    pub fn claim_ready_work(&self, limit: usize) -> Result<Vec<WorkItem>> {
        self.work.claim_ready_work(limit)
    }

    pub fn transition_work(&self, id: i64, status: WorkStatus, patch: WorkItemPatch) -> Result<Option<WorkItem>> {
        self.work.transition_work(id, status, patch)
    }

    pub fn cancel_work(&self, id: i64) -> Result<bool> {
        self.work.cancel_work(id)
    }

    pub fn get_work(&self, session_key: &str, statuses: &[WorkStatus]) -> Result<Vec<WorkItem>> {
        self.work.get_work(session_key, statuses)
    }

    // Housekeeping

    pub async fn get_stats(&self) -> Result<ManagerStats> {
        let store = self.backend.get_stats()?;
        let active_sessions = self.resident.lock().await.len();
        Ok(ManagerStats {
            store,
            active_sessions,
            total_sessions: self.total_created.load(Ordering::Relaxed),
        })
    }

    /// Spawn the periodic idle sweep and expiry cleanup. Does nothing when
    /// disabled or already running. Must be called inside a tokio runtime.
    pub fn start_maintenance(self: &Arc<Self>) -> bool {
        if !self.config.enabled {
            debug!("Parallel sessions disabled, maintenance not started");
            return false;
        }
        let mut slot = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }

        let manager = Arc::downgrade(self);
        let period = self.config.maintenance_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.run_maintenance_pass().await;
            }
        }));
        info!("Maintenance task started (every {}ms)", self.config.maintenance_interval_ms);
        true
    }

    pub fn stop_maintenance(&self) {
        let handle = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("Maintenance task stopped");
        }
    }

    /// One idle sweep plus expired memory cleanup.
    pub async fn run_maintenance_pass(&self) {
        self.sweep_idle().await;
        match self.backend.cleanup_expired() {
            Ok(0) => {}
            Ok(removed) => debug!("Maintenance removed {} expired memories", removed),
            Err(e) => warn!("Expired memory cleanup failed: {}", e),
        }
    }
}

impl Drop for ParallelSessionManager {
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::IsolationMode;

    fn manager(max_concurrent: usize) -> Arc<ParallelSessionManager> {
        let config = ParallelSessionsConfig {
            max_concurrent,
            isolation: IsolationMode::PerChannel,
            ..Default::default()
        };
        let backend = Arc::new(SharedMemoryBackend::open_in_memory().unwrap());
        ParallelSessionManager::with_backend(config, backend)
    }

    #[tokio::test]
    async fn second_request_reuses_resident_session() {
        let manager = manager(2);
        let first = manager.get_or_create_session(SessionRequest::new("discord")).await.unwrap();
        let again = manager.get_or_create_session(SessionRequest::new("Discord")).await.unwrap();
        assert!(first.is_new);
        assert!(!again.is_new);
        assert_eq!(first.session_key, again.session_key);
        assert_eq!(manager.get_stats().await.unwrap().total_sessions, 1);
    }

    #[tokio::test]
    async fn empty_channel_is_rejected() {
        let manager = manager(2);
        let err = manager.get_or_create_session(SessionRequest::new(" ")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn explicit_hibernate_persists_state() {
        let manager = manager(2);
        let handle = manager.get_or_create_session(SessionRequest::new("slack")).await.unwrap();
        assert!(manager.record_activity(&handle.session_key).await);
        let context = serde_json::json!({ "thread": "t-42", "draft": true });
        assert!(manager.set_session_context(&handle.session_key, context.clone()).await);
        manager
            .save_memory(SaveMemoryParams {
                session_key: handle.session_key.clone(),
                channel_id: "slack".into(),
                memory_type: "note".into(),
                content: "standup moved to 10:30".into(),
                importance: 5,
                expires_at: None,
            })
            .await
            .unwrap();
        let memories_before = manager
            .backend()
            .get_channel_memories(&MemoryQuery::for_channel("slack"))
            .unwrap();

        assert!(manager.hibernate_session(&handle.session_key).await.unwrap());
        assert!(!manager.hibernate_session(&handle.session_key).await.unwrap());
        assert!(!manager.record_activity(&handle.session_key).await);

        let stored = manager.backend().load_session_state(&handle.session_key).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Hibernated);
        assert_eq!(stored.message_count, 1);
        assert_eq!(stored.context.as_ref(), Some(&context));

        let resumed = manager.get_or_create_session(SessionRequest::new("slack")).await.unwrap();
        assert!(!resumed.is_new);
        let active = manager.active_sessions().await;
        assert_eq!(active[0].message_count, 1);
        assert_eq!(active[0].status, SessionStatus::Active);
        assert_eq!(active[0].context.as_ref(), Some(&context));
        assert!(manager.backend().load_session_state(&handle.session_key).unwrap().is_none());

        let memories_after = manager
            .backend()
            .get_channel_memories(&MemoryQuery::for_channel("slack"))
            .unwrap();
        assert_eq!(memories_before.len(), 1);
        assert_eq!(memories_before, memories_after);
    }

    #[tokio::test]
    async fn briefing_for_unknown_session_is_empty() {
        let manager = manager(2);
        assert_eq!(manager.generate_briefing("agent:main:parallel:nowhere").await.unwrap(), "");
    }

    #[tokio::test]
    async fn default_ttl_applies_to_saves_without_expiry() {
        let mut config = ParallelSessionsConfig::default();
        config.memory.default_ttl_ms = 60_000;
        let backend = Arc::new(SharedMemoryBackend::open_in_memory().unwrap());
        let manager = ParallelSessionManager::with_backend(config, backend);

        let saved = manager
            .save_memory(SaveMemoryParams {
                session_key: "agent:main:parallel:slack:default".into(),
                channel_id: "slack".into(),
                memory_type: "preference".into(),
                content: "prefers short answers".into(),
                importance: 4,
                expires_at: None,
            })
            .await
            .unwrap();
        let stored = manager.backend().get_channel_memory(saved.id).unwrap().unwrap();
        let expires_at = stored.expires_at.unwrap();
        assert!(expires_at > now());
        assert!(expires_at <= now() + ChronoDuration::milliseconds(60_000));
    }

    #[tokio::test]
    async fn idle_sweep_reports_without_evicting() {
        let mut config = ParallelSessionsConfig {
            isolation: IsolationMode::PerChannel,
            ..Default::default()
        };
        config.idle_timeout_ms = 0;
        let backend = Arc::new(SharedMemoryBackend::open_in_memory().unwrap());
        let manager = ParallelSessionManager::with_backend(config, backend);
        let mut rx = manager.subscribe();

        let handle = manager.get_or_create_session(SessionRequest::new("irc")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(manager.sweep_idle().await, vec![handle.session_key.clone()]);
        assert!(manager.sweep_idle().await.is_empty());
        assert_eq!(manager.active_sessions().await.len(), 1);

        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::SessionCreated { .. }));
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::SessionIdle { .. }));
    }

    #[tokio::test]
    async fn maintenance_respects_enabled_flag() {
        let config = ParallelSessionsConfig {
            enabled: false,
            ..Default::default()
        };
        let backend = Arc::new(SharedMemoryBackend::open_in_memory().unwrap());
        let disabled = ParallelSessionManager::with_backend(config, backend);
        assert!(!disabled.start_maintenance());

        let enabled = manager(1);
        assert!(enabled.start_maintenance());
        assert!(!enabled.start_maintenance());
        enabled.stop_maintenance();
        assert!(enabled.start_maintenance());
    }
}
