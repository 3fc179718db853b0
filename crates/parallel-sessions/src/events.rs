//! Outbound lifecycle notifications.
//!
//! The manager publishes a [`SessionEvent`] for every session, memory and work
//! item transition. Delivery is best effort: events are dropped when nobody is
//! subscribed, and a slow subscriber sees `RecvError::Lagged` rather than
//! blocking the publisher.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::memory_db::WorkStatus;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Why a session left the resident set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HibernateReason {
    /// Evicted to make room for another session.
    Capacity,
    /// Requested through `hibernate_session`.
    Explicit,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "session:created")]
    SessionCreated {
        session_key: String,
        channel_id: String,
    },
    #[serde(rename = "session:hibernated")]
    SessionHibernated {
        session_key: String,
        channel_id: String,
        reason: HibernateReason,
    },
    #[serde(rename = "session:reactivated")]
    SessionReactivated {
        session_key: String,
        channel_id: String,
    },
    #[serde(rename = "session:idle")]
    SessionIdle { session_key: String, idle_ms: i64 },
    #[serde(rename = "memory:saved")]
    MemorySaved {
        session_key: String,
        memory_id: i64,
        importance: u8,
    },
    #[serde(rename = "knowledge:promoted")]
    KnowledgePromoted {
        knowledge_id: i64,
        memory_id: i64,
        source_channel: String,
    },
    #[serde(rename = "work:scheduled")]
    WorkScheduled {
        work_id: i64,
        session_key: String,
        status: WorkStatus,
    },
    #[serde(rename = "work:transitioned")]
    WorkTransitioned {
        work_id: i64,
        from: WorkStatus,
        to: WorkStatus,
    },
    #[serde(rename = "work:cancelled")]
    WorkCancelled { work_id: i64 },
    #[serde(rename = "shutdown")]
    Shutdown { persisted_sessions: usize },
}

impl SessionEvent {
    /// The wire name, e.g. `session:created`.
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated { .. } => "session:created",
            SessionEvent::SessionHibernated { .. } => "session:hibernated",
            SessionEvent::SessionReactivated { .. } => "session:reactivated",
            SessionEvent::SessionIdle { .. } => "session:idle",
            SessionEvent::MemorySaved { .. } => "memory:saved",
            SessionEvent::KnowledgePromoted { .. } => "knowledge:promoted",
            SessionEvent::WorkScheduled { .. } => "work:scheduled",
            SessionEvent::WorkTransitioned { .. } => "work:transitioned",
            SessionEvent::WorkCancelled { .. } => "work:cancelled",
            SessionEvent::Shutdown { .. } => "shutdown",
        }
    }
}

/// Broadcast channel of [`SessionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        let kind = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => trace!("Published {} to {} subscribers", kind, receivers),
            Err(_) => trace!("Dropped {} (no subscribers)", kind),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SessionEvent::SessionHibernated {
            session_key: "agent:main:parallel:discord".into(),
            channel_id: "discord".into(),
            reason: HibernateReason::Capacity,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session:hibernated");
        assert_eq!(json["reason"], "capacity");
        assert_eq!(json["type"], event.event_type());

        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        bus.publish(SessionEvent::WorkCancelled { work_id: 1 });

        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(SessionEvent::WorkCancelled { work_id: 2 });
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::WorkCancelled { work_id: 2 });
    }
}
