use chrono::Utc;
use tracing::{debug, warn};

use super::{EngineEvent, SyncEngine};
use crate::models::{AgentStatus, PersistedSession, Session, TranscriptEntry, epoch_to_datetime};
use crate::persistence::PersistOp;
use crate::protocol::{ProtocolError, ServerMessage, parse_server_frame};

impl SyncEngine {
    /// Parse one text frame and route it. Bad frames are logged and dropped.
    pub(super) fn dispatch_frame(&mut self, text: &str) {
        match parse_server_frame(text) {
            Ok(msg) => {
                debug!("<- {}", msg.kind());
                self.handle_server_message(msg);
            }
            Err(e) => warn!("Dropping control frame: {}", e),
        }
    }

    pub(super) fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Sessions { sessions } => self.on_sessions(sessions),

            ServerMessage::SessionConnected { session_id } => {
                self.registry.set_connected(session_id);
            }

            ServerMessage::SessionNotFound { session_id } => {
                warn!("Relay has no session {:?}", session_id);
                self.registry.clear_connected();
                self.emit(EngineEvent::SessionNotFound { session_id });
            }

            ServerMessage::AgentStatus {
                state,
                activity,
                timestamp,
                session_id,
            } => {
                if let (Some(sid), Some(connected)) = (&session_id, self.registry.connected_id()) {
                    if sid != connected {
                        debug!("Ignoring status for unattached session {}", sid);
                        return;
                    }
                }
                let status = AgentStatus {
                    state,
                    activity,
                    timestamp: timestamp.map(epoch_to_datetime).unwrap_or_else(Utc::now),
                };
                self.status.update(status.clone());
                self.emit(EngineEvent::Status { status });
            }

            ServerMessage::Transcript {
                speaker,
                text,
                session_id,
                timestamp,
                filename,
                language,
            } => {
                let Some(session_id) =
                    session_id.or_else(|| self.registry.connected_id().map(String::from))
                else {
                    warn!("Dropping transcript: {}", ProtocolError::MissingSession);
                    return;
                };
                let entry = TranscriptEntry {
                    speaker,
                    text,
                    session_id,
                    timestamp: timestamp.map(epoch_to_datetime).unwrap_or_else(Utc::now),
                    filename,
                    language,
                };
                self.transcripts.append(entry.clone());
                self.emit(EngineEvent::Transcript { entry });
            }

            ServerMessage::DisableAutoListen { seq } => {
                if self.status.observe_disable_auto_listen(seq) {
                    self.emit(EngineEvent::AutoListenDisabled { seq });
                }
            }

            ServerMessage::TtsReady {
                session_id,
                audio_size,
            } => {
                debug!(
                    "Synthesized audio ready for {:?} ({} bytes)",
                    session_id, audio_size
                );
            }

            ServerMessage::Error { message } => warn!("Relay error: {}", message),
        }
    }

    fn on_sessions(&mut self, sessions: Vec<Session>) {
        let now = Utc::now().timestamp_millis();
        for session in sessions.iter().filter(|s| s.online) {
            self.overrides
                .entry(session.session_id.clone())
                .or_insert_with(|| PersistedSession::new(&session.session_id, now))
                .last_seen = now;
            self.writer.enqueue(PersistOp::TouchSession {
                session_id: session.session_id.clone(),
                last_seen: now,
            });
        }

        self.registry.apply_sessions(sessions);

        self.emit(EngineEvent::SessionsUpdated {
            sessions: self.views(),
        });
    }
}
