//! Data model shared by the stores, the wire protocol, and persistence.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Relay-reported health of a session's backing agent process.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    #[default]
    Ok,
    Zombie,
    Dead,
}

/// Another client attached to the same session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectedClient {
    pub client_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// A relay session as delivered in a `sessions` frame. The relay owns this
/// record; local overrides are merged in `SessionView` and never written here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub dir_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(default = "default_online")]
    pub online: bool,
    #[serde(default)]
    pub health: SessionHealth,
    /// Epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hue_override: Option<u16>,
    #[serde(default)]
    pub connected_clients: Vec<ConnectedClient>,
    /// Gates destructive controls (restart, kill) in the UI.
    #[serde(default)]
    pub daemon_managed: bool,
}

fn default_online() -> bool {
    true
}

impl Session {
    pub fn new(session_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            name: name.into(),
            display_name: None,
            cwd: String::new(),
            dir_name: String::new(),
            room_name: None,
            online: true,
            health: SessionHealth::Ok,
            last_interaction: None,
            hue_override: None,
            connected_clients: Vec::new(),
            daemon_managed: false,
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room_name = Some(room.into());
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }
}

/// Deterministic hue in `0..360` derived from a session id.
pub fn derive_hue(session_id: &str) -> u16 {
    let hash = session_id
        .chars()
        .fold(0u32, |h, c| (c as u32).wrapping_add(h.wrapping_shl(5).wrapping_sub(h)));
    (hash % 360) as u16
}

/// Render-time merge of a relay `Session` with its local overrides.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SessionView {
    pub session: Session,
    pub display_name: String,
    pub hue: u16,
    pub is_connected: bool,
}

impl SessionView {
    pub fn merge(session: &Session, local: Option<&PersistedSession>, is_connected: bool) -> Self {
        let display_name = local
            .and_then(|p| p.display_name.clone())
            .or_else(|| session.display_name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| Some(session.name.clone()).filter(|n| !n.is_empty()))
            .or_else(|| Some(session.dir_name.clone()).filter(|n| !n.is_empty()))
            .unwrap_or_else(|| session.session_id.clone());

        let hue = local
            .and_then(|p| p.hue_override)
            .or(session.hue_override)
            .filter(|h| *h < 360)
            .unwrap_or_else(|| derive_hue(&session.session_id));

        Self {
            session: session.clone(),
            display_name,
            hue,
            is_connected,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    #[serde(alias = "claude")]
    Agent,
    System,
    Activity,
    Code,
}

/// One line of a session transcript, in arrival order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl TranscriptEntry {
    pub fn new(session_id: impl Into<String>, speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            filename: None,
            language: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Thinking,
    Speaking,
    Error,
}

/// Latest agent status for the connected session. Not a history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentStatus {
    pub state: AgentState,
    pub activity: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            state: AgentState::Idle,
            activity: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Voice-room authorization. Only valid for the room it names.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoiceToken {
    pub token: String,
    pub url: String,
    pub room: String,
}

/// Local mirror of per-session customizations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedSession {
    pub session_id: String,
    pub display_name: Option<String>,
    pub hue_override: Option<u16>,
    /// Epoch milliseconds
    pub last_seen: i64,
}

impl PersistedSession {
    pub fn new(session_id: impl Into<String>, last_seen: i64) -> Self {
        Self {
            session_id: session_id.into(),
            display_name: None,
            hue_override: None,
            last_seen,
        }
    }
}

/// Convert a relay timestamp to UTC. The relay sends epoch seconds as a
/// float; anything past 1e11 is already in milliseconds.
pub fn epoch_to_datetime(value: f64) -> DateTime<Utc> {
    let millis = if value > 1e11 { value } else { value * 1000.0 };
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_else(Utc::now)
}
