use tracing::info;

use crate::models::VoiceToken;

/// The voice-room transport. Implementations join the room named by the
/// token and leave it again; media handling is theirs entirely.
pub trait VoiceRoom: Send {
    fn connect(&mut self, token: &VoiceToken);
    fn disconnect(&mut self);
}

/// Records what a real transport would be asked to do.
#[derive(Debug, Default)]
pub struct LoggingVoiceRoom {
    current: Option<String>,
}

impl LoggingVoiceRoom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_room(&self) -> Option<&str> {
        self.current.as_deref()
    }
}

impl VoiceRoom for LoggingVoiceRoom {
    fn connect(&mut self, token: &VoiceToken) {
        info!("Joining voice room {} at {}", token.room, token.url);
        self.current = Some(token.room.clone());
    }

    fn disconnect(&mut self) {
        if let Some(room) = self.current.take() {
            info!("Leaving voice room {}", room);
        }
    }
}
