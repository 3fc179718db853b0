//! Session key derivation.
//!
//! Keys have the shape `agent:{agent}:parallel:{scope}` where the scope depends
//! on the isolation mode. Channel, chat and peer ids are lower-cased so the same
//! channel spelled differently maps to one session; the agent id keeps its case.
//! `%` and `:` inside an id are percent-encoded, so ids containing the
//! separator cannot produce another request's key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

pub const DEFAULT_AGENT_ID: &str = "main";
const DEFAULT_SCOPE: &str = "default";

/// How requests are grouped into sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// One session per channel; chats and peers share it.
    PerChannel,
    /// One session per chat within a channel.
    #[default]
    PerChat,
    /// One session per peer across every channel.
    PerPeer,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::PerChannel => "per-channel",
            IsolationMode::PerChat => "per-chat",
            IsolationMode::PerPeer => "per-peer",
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "per-channel" => Ok(IsolationMode::PerChannel),
            "per-chat" => Ok(IsolationMode::PerChat),
            "per-peer" => Ok(IsolationMode::PerPeer),
            other => Err(Error::InvalidInput(format!("unknown isolation mode: {}", other))),
        }
    }
}

/// Identity of an incoming conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub channel_id: String,
    pub chat_id: Option<String>,
    pub peer_id: Option<String>,
    pub agent_id: Option<String>,
}

impl SessionRequest {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            ..Default::default()
        }
    }

    pub fn with_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_peer(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Agent id, defaulting to `main`.
    pub fn agent(&self) -> &str {
        non_empty(self.agent_id.as_deref()).unwrap_or(DEFAULT_AGENT_ID)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn escape_segment(value: &str) -> String {
    value.replace('%', "%25").replace(':', "%3A")
}

fn scope_segment(value: &str) -> String {
    escape_segment(&value.to_lowercase())
}

/// Deterministic session key for `request` under `mode`.
pub fn derive_session_key(mode: IsolationMode, request: &SessionRequest) -> String {
    let agent = escape_segment(request.agent());
    let channel = scope_segment(&request.channel_id);

    match mode {
        IsolationMode::PerChannel => format!("agent:{}:parallel:{}", agent, channel),
        IsolationMode::PerChat => {
            let chat = non_empty(request.chat_id.as_deref())
                .or_else(|| non_empty(request.peer_id.as_deref()))
                .map_or_else(|| DEFAULT_SCOPE.to_string(), scope_segment);
            format!("agent:{}:parallel:{}:{}", agent, channel, chat)
        }
        IsolationMode::PerPeer => {
            let peer = non_empty(request.peer_id.as_deref())
                .map_or_else(|| DEFAULT_SCOPE.to_string(), scope_segment);
            format!("agent:{}:parallel:peer:{}", agent, peer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn per_channel_ignores_chat_and_peer() {
        let a = SessionRequest::new("Discord").with_chat("general").with_peer("alice");
        let b = SessionRequest::new("discord").with_chat("random");
        assert_eq!(derive_session_key(IsolationMode::PerChannel, &a), "agent:main:parallel:discord");
        assert_eq!(
            derive_session_key(IsolationMode::PerChannel, &a),
            derive_session_key(IsolationMode::PerChannel, &b)
        );
    }

    #[test]
    fn per_chat_falls_back_to_peer_then_default() {
        let chat = SessionRequest::new("slack").with_chat("General").with_peer("bob");
        let peer = SessionRequest::new("slack").with_peer("Bob");
        let neither = SessionRequest::new("slack");

        assert_eq!(derive_session_key(IsolationMode::PerChat, &chat), "agent:main:parallel:slack:general");
        assert_eq!(derive_session_key(IsolationMode::PerChat, &peer), "agent:main:parallel:slack:bob");
        assert_eq!(derive_session_key(IsolationMode::PerChat, &neither), "agent:main:parallel:slack:default");
    }

    #[test]
    fn per_peer_uses_agent_and_peer() {
        let request = SessionRequest::new("telegram").with_peer("Carol").with_agent("ops");
        assert_eq!(derive_session_key(IsolationMode::PerPeer, &request), "agent:ops:parallel:peer:carol");
        assert_eq!(
            derive_session_key(IsolationMode::PerPeer, &SessionRequest::new("telegram")),
            "agent:main:parallel:peer:default"
        );
    }

    #[test]
    fn agent_id_keeps_its_case() {
        let request = SessionRequest::new("Slack").with_agent("OpsBot");
        assert_eq!(derive_session_key(IsolationMode::PerChannel, &request), "agent:OpsBot:parallel:slack");
        assert_ne!(
            derive_session_key(IsolationMode::PerChannel, &request),
            derive_session_key(IsolationMode::PerChannel, &SessionRequest::new("slack").with_agent("opsbot"))
        );
    }

    #[test]
    fn separator_inside_ids_does_not_collide() {
        let a = SessionRequest::new("a:b").with_chat("c");
        let b = SessionRequest::new("a").with_chat("b:c");
        let key_a = derive_session_key(IsolationMode::PerChat, &a);
        let key_b = derive_session_key(IsolationMode::PerChat, &b);

        assert_eq!(key_a, "agent:main:parallel:a%3Ab:c");
        assert_eq!(key_b, "agent:main:parallel:a:b%3Ac");
        assert_ne!(key_a, key_b);

        let literal = SessionRequest::new("a%3Ab").with_chat("c");
        assert_ne!(derive_session_key(IsolationMode::PerChat, &literal), key_a);

        let peer = SessionRequest::new("x").with_peer("peer:1").with_agent("a:b");
        assert_eq!(derive_session_key(IsolationMode::PerPeer, &peer), "agent:a%3Ab:parallel:peer:peer%3A1");
    }

    #[test]
    fn isolation_mode_parses_config_spellings() {
        assert_eq!("per-peer".parse::<IsolationMode>().unwrap(), IsolationMode::PerPeer);
        assert_eq!("PER_CHANNEL".parse::<IsolationMode>().unwrap(), IsolationMode::PerChannel);
        assert!("per-thread".parse::<IsolationMode>().is_err());

        let mode: IsolationMode = serde_json::from_str("\"per-chat\"").unwrap();
        assert_eq!(mode, IsolationMode::PerChat);
    }

    proptest! {
        #[test]
        fn distinct_chat_requests_get_distinct_keys(
            channel_a in "[a-z:%]{1,6}",
            chat_a in "[a-z:%]{1,6}",
            channel_b in "[a-z:%]{1,6}",
            chat_b in "[a-z:%]{1,6}",
        ) {
            prop_assume!((channel_a.as_str(), chat_a.as_str()) != (channel_b.as_str(), chat_b.as_str()));
            let a = SessionRequest::new(channel_a).with_chat(chat_a);
            let b = SessionRequest::new(channel_b).with_chat(chat_b);
            prop_assert_ne!(
                derive_session_key(IsolationMode::PerChat, &a),
                derive_session_key(IsolationMode::PerChat, &b)
            );
        }

        #[test]
        fn per_peer_key_ignores_channel(
            peer in "[A-Za-z0-9_-]{1,16}",
            first in "[a-z]{1,12}",
            second in "[a-z]{1,12}",
        ) {
            let a = SessionRequest::new(first).with_peer(peer.clone());
            let b = SessionRequest::new(second).with_peer(peer);
            prop_assert_eq!(
                derive_session_key(IsolationMode::PerPeer, &a),
                derive_session_key(IsolationMode::PerPeer, &b)
            );
        }

        #[test]
        fn per_chat_separates_chats(chat_a in "[a-z]{1,8}", chat_b in "[a-z]{1,8}") {
            prop_assume!(chat_a != chat_b);
            let a = SessionRequest::new("slack").with_chat(chat_a);
            let b = SessionRequest::new("slack").with_chat(chat_b);
            prop_assert_ne!(
                derive_session_key(IsolationMode::PerChat, &a),
                derive_session_key(IsolationMode::PerChat, &b)
            );
        }

        #[test]
        fn keys_are_case_insensitive(channel in "[A-Za-z]{1,12}", chat in "[A-Za-z]{1,12}") {
            let upper = SessionRequest::new(channel.to_uppercase()).with_chat(chat.to_uppercase());
            let lower = SessionRequest::new(channel.to_lowercase()).with_chat(chat.to_lowercase());
            prop_assert_eq!(
                derive_session_key(IsolationMode::PerChat, &upper),
                derive_session_key(IsolationMode::PerChat, &lower)
            );
        }
    }
}
