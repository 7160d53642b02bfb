use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::models::{PersistedSession, Session, SessionView};
use crate::protocol::ClientMessage;

/// Change in the set of online session ids between two `sessions` frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnlineDiff {
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

impl OnlineDiff {
    /// Joined ids keep `next` order; left ids are sorted.
    pub fn between(prev: &[String], next: &[String]) -> Self {
        let joined = next
            .iter()
            .filter(|id| !prev.contains(id))
            .cloned()
            .collect();
        let mut left: Vec<String> = prev
            .iter()
            .filter(|id| !next.contains(id))
            .cloned()
            .collect();
        left.sort();
        Self { joined, left }
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Mirror of the relay's session registry plus the locally tracked
/// "connected" session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
    connected: Option<String>,
    populated: bool,
    revision: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list wholesale.
    pub fn apply_sessions(&mut self, sessions: Vec<Session>) {
        let mut seen = HashSet::new();
        let sessions: Vec<Session> = sessions
            .into_iter()
            .filter(|s| {
                let fresh = seen.insert(s.session_id.clone());
                if !fresh {
                    debug!("Ignoring duplicate session id {}", s.session_id);
                }
                fresh
            })
            .collect();

        self.sessions = sessions;
        self.populated = true;
        self.revision += 1;
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }

    /// Bumped on every `sessions` frame.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// False until the first `sessions` frame, even an empty one.
    pub fn is_populated(&self) -> bool {
        self.populated
    }

    /// Online ids in server order.
    pub fn online_ids(&self) -> impl Iterator<Item = &str> {
        self.sessions
            .iter()
            .filter(|s| s.online)
            .map(|s| s.session_id.as_str())
    }

    pub fn connected_id(&self) -> Option<&str> {
        self.connected.as_deref()
    }

    pub fn connected_session(&self) -> Option<&Session> {
        self.connected.as_deref().and_then(|id| self.get(id))
    }

    /// Relay confirmed the attachment.
    pub fn set_connected(&mut self, session_id: String) {
        if self.connected.as_deref() != Some(session_id.as_str()) {
            info!("Connected to session {}", session_id);
        }
        self.connected = Some(session_id);
    }

    pub fn clear_connected(&mut self) -> Option<String> {
        self.connected.take()
    }

    /// Outbound request only; the local connected id changes when the relay
    /// answers with `session_connected`.
    pub fn connect_session(&self, session_id: &str) -> ClientMessage {
        ClientMessage::ConnectSession {
            session_id: session_id.to_string(),
        }
    }

    /// Clears the connected id immediately; the relay's next message remains
    /// authoritative.
    pub fn disconnect_session(&mut self) -> ClientMessage {
        if let Some(id) = self.connected.take() {
            debug!("Optimistically detached from {}", id);
        }
        ClientMessage::DisconnectSession
    }

    /// Voice room for the connected session. `None` when nothing is connected
    /// or the connected session is not in the current list.
    pub fn target_room(&self, default_room: &str) -> Option<String> {
        self.connected_session().map(|s| {
            s.room_name
                .clone()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| default_room.to_string())
        })
    }

    /// Connected session first, the rest in server order.
    pub fn display_order(&self) -> Vec<&Session> {
        let connected = self.connected.as_deref();
        let mut ordered: Vec<&Session> = Vec::with_capacity(self.sessions.len());
        ordered.extend(
            self.sessions
                .iter()
                .filter(|s| Some(s.session_id.as_str()) == connected),
        );
        ordered.extend(
            self.sessions
                .iter()
                .filter(|s| Some(s.session_id.as_str()) != connected),
        );
        ordered
    }

    /// Display-ordered views with local overrides merged in.
    pub fn views(&self, overrides: &HashMap<String, PersistedSession>) -> Vec<SessionView> {
        let connected = self.connected.as_deref();
        self.display_order()
            .into_iter()
            .map(|s| {
                SessionView::merge(
                    s,
                    overrides.get(&s.session_id),
                    Some(s.session_id.as_str()) == connected,
                )
            })
            .collect()
    }
}
