//! Record types for the shared memory database.
//!
//! Timestamps are `DateTime<Utc>` in memory and epoch milliseconds on disk so
//! that expiry and due-time comparisons stay numeric in SQL.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Current time truncated to the millisecond precision the database keeps.
pub fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Hibernated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Hibernated => "hibernated",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "hibernated" => Ok(SessionStatus::Hibernated),
            other => Err(Error::InvalidInput(format!("unknown session status: {}", other))),
        }
    }
}

/// A session as it is held in the resident map or persisted while hibernated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_key: String,
    pub channel_id: String,
    pub chat_id: Option<String>,
    pub peer_id: Option<String>,
    pub agent_id: String,
    pub status: SessionStatus,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Opaque host state kept with the session across hibernation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Input for a channel memory insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChannelMemory {
    pub session_key: String,
    pub channel_id: String,
    pub memory_type: String,
    pub content: String,
    pub importance: u8,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMemoryEntry {
    pub id: i64,
    pub session_key: String,
    pub channel_id: String,
    pub memory_type: String,
    pub content: String,
    pub importance: u8,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub promoted_to_global: bool,
}

/// Outcome of a channel memory save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SavedMemory {
    pub id: i64,
    pub promoted_knowledge_id: Option<i64>,
}

impl SavedMemory {
    pub fn promoted(&self) -> bool {
        self.promoted_knowledge_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalKnowledgeEntry {
    pub id: i64,
    pub category: String,
    pub content: String,
    pub confidence: f64,
    pub source_channel: String,
    pub source_session_key: String,
    pub source_memory_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Filters for channel memory reads. The default excludes expired rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub channel_id: Option<String>,
    pub session_key: Option<String>,
    pub memory_types: Vec<String>,
    pub min_importance: Option<u8>,
    pub limit: Option<usize>,
    pub include_expired: bool,
}

impl MemoryQuery {
    pub fn for_channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KnowledgeQuery {
    pub category: Option<String>,
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    Channel,
    Global,
    #[default]
    Both,
}

impl SearchScope {
    pub fn includes_channel(&self) -> bool {
        matches!(self, SearchScope::Channel | SearchScope::Both)
    }

    pub fn includes_global(&self) -> bool {
        matches!(self, SearchScope::Global | SearchScope::Both)
    }
}

impl FromStr for SearchScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "channel" => Ok(SearchScope::Channel),
            "global" => Ok(SearchScope::Global),
            "both" | "all" => Ok(SearchScope::Both),
            other => Err(Error::InvalidInput(format!("unknown search scope: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub scope: SearchScope,
    /// Restricts channel hits to one channel. Global hits are never filtered.
    pub channel_id: Option<String>,
    /// Per-scope cap.
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            scope: SearchScope::Both,
            channel_id: None,
            limit: 20,
        }
    }
}

/// One search hit, tagged by the table it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MemorySearchHit {
    Channel(ChannelMemoryEntry),
    Global(GlobalKnowledgeEntry),
}

impl MemorySearchHit {
    pub fn content(&self) -> &str {
        match self {
            MemorySearchHit::Channel(entry) => &entry.content,
            MemorySearchHit::Global(entry) => &entry.content,
        }
    }

    pub fn session_key(&self) -> Option<&str> {
        match self {
            MemorySearchHit::Channel(entry) => Some(&entry.session_key),
            MemorySearchHit::Global(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Scheduled,
    Ready,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl WorkStatus {
    pub const NON_TERMINAL: [WorkStatus; 3] =
        [WorkStatus::Scheduled, WorkStatus::Ready, WorkStatus::Executing];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Scheduled => "scheduled",
            WorkStatus::Ready => "ready",
            WorkStatus::Executing => "executing",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStatus::Completed | WorkStatus::Failed | WorkStatus::Cancelled
        )
    }

    /// Whether a work item may move from `self` to `next`.
    ///
    /// `is_retry` marks an explicit retry (the caller raised `attempts`); it is
    /// the only way out of `failed`. Same-state updates are allowed while the
    /// item is not terminal so executors can report progress.
    pub fn can_transition_to(&self, next: WorkStatus, is_retry: bool) -> bool {
        use WorkStatus::*;
        match (*self, next) {
            (from, to) if from == to => !from.is_terminal(),
            (Scheduled, Ready | Cancelled) => true,
            (Ready, Executing | Cancelled) => true,
            (Executing, Completed | Failed | Ready) => true,
            (Failed, Ready) => is_retry,
            _ => false,
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(WorkStatus::Scheduled),
            "ready" => Ok(WorkStatus::Ready),
            "executing" => Ok(WorkStatus::Executing),
            "completed" => Ok(WorkStatus::Completed),
            "failed" => Ok(WorkStatus::Failed),
            "cancelled" => Ok(WorkStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown work status: {}", other))),
        }
    }
}

/// Input for a work item insert. Status is decided by the work queue.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub session_key: String,
    pub channel_id: String,
    pub description: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub status: WorkStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub session_key: String,
    pub channel_id: String,
    pub description: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub status: WorkStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub progress_pct: u8,
    pub result_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Callers check this before moving a failed or executing item back to ready.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Fields a transition may update alongside the status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkItemPatch {
    pub attempts: Option<i64>,
    pub progress_pct: Option<u8>,
    pub result_summary: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkItemFilter {
    pub session_key: Option<String>,
    pub channel_id: Option<String>,
    /// Empty means any status.
    pub statuses: Vec<WorkStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub channel_memory_count: i64,
    pub global_knowledge_count: i64,
    pub executing_work_items: i64,
    pub active_work_items: i64,
    pub hibernated_sessions: i64,
    pub distinct_sessions: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_no_transitions() {
        for from in [WorkStatus::Completed, WorkStatus::Cancelled] {
            for to in [
                WorkStatus::Scheduled,
                WorkStatus::Ready,
                WorkStatus::Executing,
                WorkStatus::Completed,
                WorkStatus::Failed,
                WorkStatus::Cancelled,
            ] {
                assert!(!from.can_transition_to(to, true), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn failed_only_leaves_through_retry() {
        assert!(!WorkStatus::Failed.can_transition_to(WorkStatus::Ready, false));
        assert!(WorkStatus::Failed.can_transition_to(WorkStatus::Ready, true));
        assert!(!WorkStatus::Failed.can_transition_to(WorkStatus::Executing, true));
    }

    #[test]
    fn executing_is_not_cancellable() {
        assert!(!WorkStatus::Executing.can_transition_to(WorkStatus::Cancelled, false));
        assert!(WorkStatus::Ready.can_transition_to(WorkStatus::Cancelled, false));
        assert!(WorkStatus::Scheduled.can_transition_to(WorkStatus::Cancelled, false));
    }

    #[test]
    fn progress_updates_keep_state() {
        assert!(WorkStatus::Executing.can_transition_to(WorkStatus::Executing, false));
    }

    #[test]
    fn search_hits_serialize_with_kind_tag() {
        let hit = MemorySearchHit::Global(GlobalKnowledgeEntry {
            id: 1,
            category: "fact".into(),
            content: "deploys happen on fridays".into(),
            confidence: 0.9,
            source_channel: "discord".into(),
            source_session_key: "agent:main:parallel:discord".into(),
            source_memory_id: Some(4),
            created_at: from_millis(0),
        });
        let json = serde_json::to_value(&hit).unwrap();
        assert_eq!(json["kind"], "global");
        assert!(hit.session_key().is_none());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            WorkStatus::Scheduled,
            WorkStatus::Ready,
            WorkStatus::Executing,
            WorkStatus::Completed,
            WorkStatus::Failed,
            WorkStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<WorkStatus>().unwrap(), status);
        }
        assert!("paused".parse::<WorkStatus>().is_err());
        assert_eq!("ALL".parse::<SearchScope>().unwrap(), SearchScope::Both);
    }

    #[test]
    fn now_has_millisecond_precision() {
        let t = now();
        assert_eq!(from_millis(to_millis(t)), t);
    }
}
