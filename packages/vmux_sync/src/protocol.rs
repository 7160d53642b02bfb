//! Control-channel protocol
//!
//! JSON frames tagged by `type`. The relay is authoritative for everything it
//! sends; the client only issues the three commands in `ClientMessage`.

use serde::{Deserialize, Serialize};

use crate::models::{AgentState, Session, Speaker};

/// Messages sent FROM the client TO the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectSession { session_id: String },
    DisconnectSession,
    /// Stop the agent's current utterance / turn.
    Interrupt,
}

/// Messages sent FROM the relay TO the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full registry snapshot; replaces the local list wholesale.
    Sessions { sessions: Vec<Session> },
    SessionConnected { session_id: String },
    SessionNotFound {
        #[serde(default)]
        session_id: Option<String>,
    },
    AgentStatus {
        state: AgentState,
        #[serde(default)]
        activity: Option<String>,
        #[serde(default)]
        timestamp: Option<f64>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Transcript {
        speaker: Speaker,
        #[serde(default)]
        text: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        timestamp: Option<f64>,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        language: Option<String>,
    },
    /// Tell the UI to stop auto-listening. `seq` only ever increases.
    DisableAutoListen { seq: u64 },
    /// Synthesized audio is about to follow as a binary frame.
    TtsReady {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        audio_size: u64,
    },
    Error { message: String },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Sessions { .. } => "sessions",
            ServerMessage::SessionConnected { .. } => "session_connected",
            ServerMessage::SessionNotFound { .. } => "session_not_found",
            ServerMessage::AgentStatus { .. } => "agent_status",
            ServerMessage::Transcript { .. } => "transcript",
            ServerMessage::DisableAutoListen { .. } => "disable_auto_listen",
            ServerMessage::TtsReady { .. } => "tts_ready",
            ServerMessage::Error { .. } => "error",
        }
    }
}

const KNOWN_TYPES: &[&str] = &[
    "sessions",
    "session_connected",
    "session_not_found",
    "agent_status",
    "transcript",
    "disable_auto_listen",
    "tts_ready",
    "error",
];

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("frame has no session and none is connected")]
    MissingSession,
}

/// Parse a text frame into a `ServerMessage`, separating unknown types from
/// payloads that fail to decode.
pub fn parse_server_frame(text: &str) -> Result<ServerMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }
    Ok(serde_json::from_value(value)?)
}

pub fn encode_client_message(msg: &ClientMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_session_wire_shape() {
        let json = serde_json::to_value(ClientMessage::ConnectSession {
            session_id: "s1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "connect_session");
        assert_eq!(json["session_id"], "s1");
    }

    #[test]
    fn unit_commands_carry_only_type() {
        let json = serde_json::to_value(ClientMessage::DisconnectSession).unwrap();
        assert_eq!(json, serde_json::json!({"type": "disconnect_session"}));
        let json = serde_json::to_value(ClientMessage::Interrupt).unwrap();
        assert_eq!(json, serde_json::json!({"type": "interrupt"}));
    }

    #[test]
    fn parse_sessions_frame() {
        let msg = parse_server_frame(
            r#"{"type":"sessions","sessions":[{"session_id":"a","name":"A"},{"session_id":"b","name":"B","online":false}]}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Sessions { sessions } => {
                assert_eq!(sessions.len(), 2);
                assert!(!sessions[1].online);
            }
            other => panic!("Expected Sessions, got {:?}", other),
        }
    }

    #[test]
    fn parse_transcript_from_relay() {
        let msg = parse_server_frame(
            r#"{"type":"transcript","speaker":"claude","text":"hi","session_id":"s1"}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Transcript {
                speaker,
                text,
                session_id,
                timestamp,
                ..
            } => {
                assert_eq!(speaker, Speaker::Agent);
                assert_eq!(text, "hi");
                assert_eq!(session_id.as_deref(), Some("s1"));
                assert!(timestamp.is_none());
            }
            other => panic!("Expected Transcript, got {:?}", other),
        }
    }

    #[test]
    fn parse_code_transcript() {
        let msg = parse_server_frame(
            r#"{"type":"transcript","speaker":"code","text":"fn main() {}","session_id":"s1","filename":"main.rs","language":"rust","timestamp":1700000000.0}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Transcript {
                filename, language, ..
            } => {
                assert_eq!(filename.as_deref(), Some("main.rs"));
                assert_eq!(language.as_deref(), Some("rust"));
            }
            other => panic!("Expected Transcript, got {:?}", other),
        }
    }

    #[test]
    fn parse_agent_status_with_null_activity() {
        let msg = parse_server_frame(
            r#"{"type":"agent_status","state":"thinking","activity":null,"timestamp":1700000000.25}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), "agent_status");
    }

    #[test]
    fn session_not_found_without_id() {
        let msg = parse_server_frame(r#"{"type":"session_not_found"}"#).unwrap();
        assert_eq!(msg, ServerMessage::SessionNotFound { session_id: None });
    }

    #[test]
    fn unknown_type_is_distinguished() {
        match parse_server_frame(r#"{"type":"pong"}"#) {
            Err(ProtocolError::UnknownType(t)) => assert_eq!(t, "pong"),
            other => panic!("Expected UnknownType, got {:?}", other),
        }
        match parse_server_frame(r#"{"sessions":[]}"#) {
            Err(ProtocolError::UnknownType(t)) => assert!(t.is_empty()),
            other => panic!("Expected UnknownType, got {:?}", other),
        }
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(
            parse_server_frame("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        // known type, wrong shape
        assert!(matches!(
            parse_server_frame(r#"{"type":"agent_status","state":"dancing"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
