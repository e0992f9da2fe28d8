//! Per-channel conversation state: activation flag, system-prompt override and
//! a rolling history window.
//!
//! Nothing is persisted; state lives for the lifetime of the process. The map is
//! guarded by a plain mutex held only for short bookkeeping. A separate
//! per-channel async lock (`turn_lock`) serializes whole prompt/reply cycles so
//! two messages in one channel append their turns in reply order, while other
//! channels proceed concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Opaque channel identifier (Discord channel id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(pub u64);

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    /// Role name as the provider expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One message in a conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub attachment_ref: Option<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>, attachment_ref: Option<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            attachment_ref,
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            content: content.into(),
            attachment_ref: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSession {
    pub active: bool,
    pub system_prompt: Option<String>,
    pub history: Vec<Turn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateOutcome {
    Activated,
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivateOutcome {
    Deactivated,
    NotActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemPromptOutcome {
    Updated,
    NotActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared(usize),
    NothingToClear,
}

pub struct SessionStore {
    history_limit: usize,
    sessions: Mutex<HashMap<ChannelKey, ChannelSession>>,
    turn_locks: Mutex<HashMap<ChannelKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    /// `history_limit` is in rounds; `2 * history_limit` turns are kept.
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit: history_limit.max(1),
            sessions: Mutex::new(HashMap::new()),
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_turns(&self) -> usize {
        self.history_limit * 2
    }

    // A poisoned lock only means another handler panicked mid-update; the map itself is still usable.
    fn sessions(&self) -> MutexGuard<'_, HashMap<ChannelKey, ChannelSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn activate(&self, channel: ChannelKey, system_prompt: Option<String>) -> ActivateOutcome {
        let mut sessions = self.sessions();
        let session = sessions.entry(channel).or_default();
        if session.active {
            return ActivateOutcome::AlreadyActive;
        }
        session.active = true;
        if system_prompt.is_some() {
            session.system_prompt = system_prompt;
        }
        debug!("Session: channel {} activated", channel);
        ActivateOutcome::Activated
    }

    /// Drops the whole session (history and override), not just the flag.
    pub fn deactivate(&self, channel: ChannelKey) -> DeactivateOutcome {
        let mut sessions = self.sessions();
        match sessions.get(&channel) {
            Some(s) if s.active => {
                sessions.remove(&channel);
                debug!("Session: channel {} deactivated", channel);
                DeactivateOutcome::Deactivated
            }
            _ => DeactivateOutcome::NotActive,
        }
    }

    pub fn is_active(&self, channel: ChannelKey) -> bool {
        self.sessions().get(&channel).is_some_and(|s| s.active)
    }

    /// Only activated channels accept an override.
    pub fn set_system_prompt(&self, channel: ChannelKey, prompt: String) -> SystemPromptOutcome {
        let mut sessions = self.sessions();
        match sessions.get_mut(&channel) {
            Some(s) if s.active => {
                s.system_prompt = Some(prompt);
                SystemPromptOutcome::Updated
            }
            _ => SystemPromptOutcome::NotActive,
        }
    }

    /// Drops stored turns; the override and activation flag are kept.
    pub fn clear_history(&self, channel: ChannelKey) -> ClearOutcome {
        let mut sessions = self.sessions();
        match sessions.get_mut(&channel) {
            Some(s) if !s.history.is_empty() => {
                let n = s.history.len();
                s.history.clear();
                ClearOutcome::Cleared(n)
            }
            _ => ClearOutcome::NothingToClear,
        }
    }

    /// Append, then evict oldest turns beyond `2 * history_limit`.
    /// Creates an inactive session if the channel has none.
    pub fn append_turn(&self, channel: ChannelKey, turn: Turn) {
        let max = self.max_turns();
        let mut sessions = self.sessions();
        let session = sessions.entry(channel).or_default();
        session.history.push(turn);
        if session.history.len() > max {
            let excess = session.history.len() - max;
            session.history.drain(..excess);
        }
    }

    pub fn snapshot(&self, channel: ChannelKey) -> Option<ChannelSession> {
        self.sessions().get(&channel).cloned()
    }

    pub fn history(&self, channel: ChannelKey) -> Vec<Turn> {
        self.sessions()
            .get(&channel)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub fn system_prompt(&self, channel: ChannelKey) -> Option<String> {
        self.sessions().get(&channel).and_then(|s| s.system_prompt.clone())
    }

    /// Async lock held for a full prompt/reply cycle in one channel.
    ///
    /// Locks nobody else holds a handle to are dropped here, so the map only
    /// tracks channels with a cycle in progress or waiting.
    pub fn turn_lock(&self, channel: ChannelKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.turn_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(channel).or_default().clone()
    }
}
