//! The resident set: sessions currently held in memory, with recency tracking
//! for eviction.
//!
//! Recency is an activity sequence number rather than the wall-clock
//! `last_activity_at`, so two touches within the same millisecond still order
//! correctly.

use std::collections::HashMap;

use crate::memory_db::{now, to_millis, SessionState, SessionStatus};

struct ResidentSession {
    state: SessionState,
    seq: u64,
    idle_reported: bool,
}

pub struct ResidentSet {
    sessions: HashMap<String, ResidentSession>,
    capacity: usize,
    clock: u64,
}

impl ResidentSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: HashMap::with_capacity(capacity),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.capacity
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.sessions.contains_key(session_key)
    }

    pub fn get(&self, session_key: &str) -> Option<&SessionState> {
        self.sessions.get(session_key).map(|s| &s.state)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Mark a session as just used. Returns false if it is not resident.
    pub fn touch(&mut self, session_key: &str) -> bool {
        let seq = self.tick();
        match self.sessions.get_mut(session_key) {
            Some(session) => {
                session.state.last_activity_at = now();
                session.seq = seq;
                session.idle_reported = false;
                true
            }
            None => false,
        }
    }

    /// Touch and bump the message counter.
    pub fn record_message(&mut self, session_key: &str) -> bool {
        if !self.touch(session_key) {
            return false;
        }
        if let Some(session) = self.sessions.get_mut(session_key) {
            session.state.message_count += 1;
        }
        true
    }

    /// Replace the host context of a resident session without touching it.
    pub fn set_context(&mut self, session_key: &str, context: Option<serde_json::Value>) -> bool {
        match self.sessions.get_mut(session_key) {
            Some(session) => {
                session.state.context = context;
                true
            }
            None => false,
        }
    }

    /// Admit `state` as the most recently used session. The caller makes room
    /// first; this never evicts.
    pub fn insert(&mut self, mut state: SessionState) {
        let seq = self.tick();
        state.status = SessionStatus::Active;
        self.sessions.insert(
            state.session_key.clone(),
            ResidentSession {
                state,
                seq,
                idle_reported: false,
            },
        );
    }

    pub fn remove(&mut self, session_key: &str) -> Option<SessionState> {
        self.sessions.remove(session_key).map(|s| s.state)
    }

    /// Key of the least recently used session.
    pub fn lru_victim(&self) -> Option<String> {
        self.sessions
            .iter()
            .min_by_key(|(_, s)| s.seq)
            .map(|(key, _)| key.clone())
    }

    /// Resident sessions, most recently used first.
    pub fn snapshot(&self) -> Vec<SessionState> {
        let mut sessions: Vec<_> = self.sessions.values().collect();
        sessions.sort_by(|a, b| b.seq.cmp(&a.seq));
        sessions.into_iter().map(|s| s.state.clone()).collect()
    }

    /// Remove every session, least recently used first.
    pub fn drain(&mut self) -> Vec<SessionState> {
        let mut sessions: Vec<_> = self.sessions.drain().map(|(_, s)| s).collect();
        sessions.sort_by_key(|s| s.seq);
        sessions.into_iter().map(|s| s.state).collect()
    }

    /// Sessions idle for longer than `timeout_ms` that have not been reported
    /// since their last activity, with their idle time. Marks them reported.
    pub fn take_newly_idle(&mut self, timeout_ms: i64) -> Vec<(String, i64)> {
        let now_ms = to_millis(now());
        let mut idle = Vec::new();
        for (key, session) in self.sessions.iter_mut() {
            let idle_ms = now_ms - to_millis(session.state.last_activity_at);
            if idle_ms > timeout_ms && !session.idle_reported {
                session.idle_reported = true;
                idle.push((key.clone(), idle_ms));
            }
        }
        idle.sort();
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn state(key: &str) -> SessionState {
        let at = now();
        SessionState {
            session_key: key.to_string(),
            channel_id: "discord".to_string(),
            chat_id: None,
            peer_id: None,
            agent_id: "main".to_string(),
            status: SessionStatus::Hibernated,
            message_count: 0,
            created_at: at,
            last_activity_at: at,
            context: None,
        }
    }

    #[test]
    fn victim_is_least_recently_touched() {
        let mut set = ResidentSet::new(3);
        set.insert(state("a"));
        set.insert(state("b"));
        set.insert(state("c"));
        assert!(set.is_full());
        assert_eq!(set.lru_victim().as_deref(), Some("a"));

        assert!(set.touch("a"));
        assert_eq!(set.lru_victim().as_deref(), Some("b"));
        assert!(!set.touch("missing"));
    }

    #[test]
    fn inserted_sessions_are_active() {
        let mut set = ResidentSet::new(1);
        set.insert(state("a"));
        assert_eq!(set.get("a").unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn record_message_counts() {
        let mut set = ResidentSet::new(2);
        set.insert(state("a"));
        assert!(set.record_message("a"));
        assert!(set.record_message("a"));
        assert_eq!(set.get("a").unwrap().message_count, 2);
        assert!(!set.record_message("b"));
    }

    #[test]
    fn snapshot_and_drain_orders() {
        let mut set = ResidentSet::new(3);
        set.insert(state("a"));
        set.insert(state("b"));
        set.touch("a");

        let keys: Vec<_> = set.snapshot().into_iter().map(|s| s.session_key).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let drained: Vec<_> = set.drain().into_iter().map(|s| s.session_key).collect();
        assert_eq!(drained, vec!["b", "a"]);
        assert!(set.is_empty());
    }

    #[test]
    fn idle_sessions_are_reported_once() {
        let mut set = ResidentSet::new(2);
        let mut old = state("old");
        old.last_activity_at = now() - Duration::minutes(10);
        set.insert(old);
        set.insert(state("fresh"));

        let idle = set.take_newly_idle(60_000);
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].0, "old");
        assert!(idle[0].1 >= 600_000);
        assert!(set.take_newly_idle(60_000).is_empty());

        set.touch("old");
        assert!(set.take_newly_idle(60_000).is_empty());
    }
}
