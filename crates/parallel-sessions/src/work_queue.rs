//! Scheduling and lifecycle of background work attached to sessions.
//!
//! Executors poll [`WorkQueue::claim_ready_work`], report progress and results
//! through [`WorkQueue::transition_work`], and decide on retries themselves
//! using [`WorkItem::can_retry`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::{EventBus, SessionEvent};
use crate::memory_db::{
    now, NewWorkItem, SharedMemoryBackend, WorkItem, WorkItemFilter, WorkItemPatch, WorkStatus,
};
use crate::metrics;

pub const DEFAULT_PRIORITY: i64 = 5;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleWorkParams {
    pub session_key: String,
    pub channel_id: String,
    pub description: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Higher runs first. Defaults to 5.
    pub priority: Option<i64>,
    /// Held back as `scheduled` until this time; absent means ready now.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Defaults to 3.
    pub max_attempts: Option<i64>,
}

impl ScheduleWorkParams {
    pub fn new(
        session_key: impl Into<String>,
        channel_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            channel_id: channel_id.into(),
            description: description.into(),
            payload: serde_json::Value::Object(Default::default()),
            priority: None,
            scheduled_for: None,
            max_attempts: None,
        }
    }
}

pub struct WorkQueue {
    backend: Arc<SharedMemoryBackend>,
    events: EventBus,
}

impl WorkQueue {
    pub fn new(backend: Arc<SharedMemoryBackend>, events: EventBus) -> Self {
        Self { backend, events }
    }

    pub fn schedule_work(&self, params: ScheduleWorkParams) -> Result<WorkItem> {
        if params.description.trim().is_empty() {
            return Err(Error::InvalidInput("work description cannot be empty".to_string()));
        }

        let status = match params.scheduled_for {
            Some(at) if at > now() => WorkStatus::Scheduled,
            _ => WorkStatus::Ready,
        };
        let payload = if params.payload.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            params.payload
        };

        let item = self.backend.save_work_item(&NewWorkItem {
            session_key: params.session_key,
            channel_id: params.channel_id,
            description: params.description,
            payload,
            priority: params.priority.unwrap_or(DEFAULT_PRIORITY),
            status,
            scheduled_for: params.scheduled_for,
            max_attempts: params.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        })?;

        info!("Scheduled work item {} ({}) for {}", item.id, item.status, item.session_key);
        self.events.publish(SessionEvent::WorkScheduled {
            work_id: item.id,
            session_key: item.session_key.clone(),
            status: item.status,
        });
        Ok(item)
    }

    /// Hand out up to `limit` ready items, now marked executing.
    pub fn claim_ready_work(&self, limit: usize) -> Result<Vec<WorkItem>> {
        let claimed = self.backend.claim_work_items(limit)?;
        if !claimed.is_empty() {
            metrics::inc_work_claimed(claimed.len());
            debug!("Claimed work items {:?}", claimed.iter().map(|w| w.id).collect::<Vec<_>>());
        }
        Ok(claimed)
    }

    /// Move an item to `status`. `None` means the id is unknown; an illegal
    /// move fails with [`Error::InvalidTransition`] and changes nothing.
    pub fn transition_work(
        &self,
        id: i64,
        status: WorkStatus,
        patch: WorkItemPatch,
    ) -> Result<Option<WorkItem>> {
        let Some((from, item)) = self.backend.transition_work_item(id, status, &patch)? else {
            return Ok(None);
        };

        if from != item.status {
            info!("Work item {} {} -> {}", id, from, item.status);
        }
        self.events.publish(SessionEvent::WorkTransitioned {
            work_id: id,
            from,
            to: item.status,
        });
        Ok(Some(item))
    }

    /// Cancel a scheduled or ready item. Executing and finished items are left
    /// alone and yield `false`.
    pub fn cancel_work(&self, id: i64) -> Result<bool> {
        let cancelled = self.backend.cancel_work_item(id)?;
        if cancelled {
            info!("Cancelled work item {}", id);
            self.events.publish(SessionEvent::WorkCancelled { work_id: id });
        }
        Ok(cancelled)
    }

    /// Work for one session, optionally restricted to some statuses.
    pub fn get_work(&self, session_key: &str, statuses: &[WorkStatus]) -> Result<Vec<WorkItem>> {
        self.backend.get_work_items(&WorkItemFilter {
            session_key: Some(session_key.to_string()),
            statuses: statuses.to_vec(),
            ..Default::default()
        })
    }
}
