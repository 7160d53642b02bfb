//! Voice-room token bookkeeping.
//!
//! At most one token is held and at most one fetch is pending. Fetches are
//! never aborted; a response for a room that is no longer the target is
//! recognized on completion and dropped.

use tracing::{debug, info};

use crate::models::VoiceToken;

/// Side effect requested by [`TokenCoordinator::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenAction {
    /// The held token is no longer valid and must be released.
    Discard(VoiceToken),
    Fetch(String),
}

/// What happened to a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    Committed(VoiceToken),
    /// The target moved on while the fetch was in flight.
    Stale,
    /// A token for this room is already held.
    Redundant,
    Failed,
}

#[derive(Debug, Default)]
pub struct TokenCoordinator {
    held: Option<VoiceToken>,
    pending_room: Option<String>,
}

impl TokenCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> Option<&VoiceToken> {
        self.held.as_ref()
    }

    pub fn held_room(&self) -> Option<&str> {
        self.held.as_ref().map(|t| t.room.as_str())
    }

    pub fn pending_room(&self) -> Option<&str> {
        self.pending_room.as_deref()
    }

    /// Bring held/pending state in line with the room of the connected
    /// session. Calling it again with the same target is a no-op.
    pub fn reconcile(&mut self, target: Option<&str>) -> Vec<TokenAction> {
        let Some(room) = target else {
            return self
                .held
                .take()
                .map(|token| {
                    debug!("No session connected, releasing token for {}", token.room);
                    vec![TokenAction::Discard(token)]
                })
                .unwrap_or_default();
        };

        if self.held_room() == Some(room) || self.pending_room() == Some(room) {
            return Vec::new();
        }

        let mut actions = Vec::with_capacity(2);
        if let Some(token) = self.held.take() {
            actions.push(TokenAction::Discard(token));
        }
        self.pending_room = Some(room.to_string());
        actions.push(TokenAction::Fetch(room.to_string()));
        actions
    }

    /// Record the result of a fetch for `room`. `current_target` is the room
    /// of the connected session at the time the response is handled.
    pub fn complete(
        &mut self,
        room: &str,
        result: Option<VoiceToken>,
        current_target: Option<&str>,
    ) -> TokenOutcome {
        if self.pending_room() == Some(room) {
            self.pending_room = None;
        }

        if current_target != Some(room) {
            debug!(
                "Dropping token for {} (target is now {:?})",
                room, current_target
            );
            return TokenOutcome::Stale;
        }

        let Some(mut token) = result else {
            return TokenOutcome::Failed;
        };

        if self.held_room() == Some(room) {
            return TokenOutcome::Redundant;
        }

        if token.room.is_empty() {
            token.room = room.to_string();
        }
        info!("Voice token ready for room {}", room);
        self.held = Some(token.clone());
        TokenOutcome::Committed(token)
    }

    /// Release everything, e.g. on teardown.
    pub fn reset(&mut self) -> Option<VoiceToken> {
        self.pending_room = None;
        self.held.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(room: &str) -> VoiceToken {
        VoiceToken {
            token: format!("jwt-{}", room),
            url: "wss://voice.example".into(),
            room: room.into(),
        }
    }

    fn fetches(actions: &[TokenAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|a| match a {
                TokenAction::Fetch(room) => Some(room.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn repeated_reconcile_fetches_once() {
        let mut tc = TokenCoordinator::new();
        assert_eq!(tc.reconcile(Some("r1")), vec![TokenAction::Fetch("r1".into())]);
        assert!(tc.reconcile(Some("r1")).is_empty());
        assert!(tc.reconcile(Some("r1")).is_empty());
        assert_eq!(tc.pending_room(), Some("r1"));
    }

    #[test]
    fn held_token_suppresses_refetch() {
        let mut tc = TokenCoordinator::new();
        tc.reconcile(Some("r1"));
        assert_eq!(
            tc.complete("r1", Some(token("r1")), Some("r1")),
            TokenOutcome::Committed(token("r1"))
        );
        assert!(tc.pending_room().is_none());
        assert!(tc.reconcile(Some("r1")).is_empty());
    }

    #[test]
    fn away_and_back_while_pending_fetches_once() {
        let mut tc = TokenCoordinator::new();
        let mut all = Vec::new();
        all.extend(tc.reconcile(Some("r1")));
        all.extend(tc.reconcile(None));
        all.extend(tc.reconcile(Some("r1")));
        assert_eq!(fetches(&all), vec!["r1"]);

        assert!(matches!(
            tc.complete("r1", Some(token("r1")), Some("r1")),
            TokenOutcome::Committed(_)
        ));
        assert_eq!(tc.held_room(), Some("r1"));
    }

    #[test]
    fn no_session_discards_held_token() {
        let mut tc = TokenCoordinator::new();
        tc.reconcile(Some("r1"));
        tc.complete("r1", Some(token("r1")), Some("r1"));

        assert_eq!(tc.reconcile(None), vec![TokenAction::Discard(token("r1"))]);
        assert!(tc.held().is_none());
        assert!(tc.reconcile(None).is_empty());

        // discarded explicitly, so coming back fetches again
        assert_eq!(fetches(&tc.reconcile(Some("r1"))), vec!["r1"]);
    }

    #[test]
    fn switching_rooms_discards_then_fetches() {
        let mut tc = TokenCoordinator::new();
        tc.reconcile(Some("r1"));
        tc.complete("r1", Some(token("r1")), Some("r1"));

        assert_eq!(
            tc.reconcile(Some("r2")),
            vec![
                TokenAction::Discard(token("r1")),
                TokenAction::Fetch("r2".into())
            ]
        );
        assert!(tc.held().is_none());
    }

    #[test]
    fn late_response_never_overwrites_newer_room() {
        let mut tc = TokenCoordinator::new();
        tc.reconcile(Some("r1"));
        tc.reconcile(Some("r2"));
        assert_eq!(tc.pending_room(), Some("r2"));

        // r1 resolves after the switch
        assert_eq!(
            tc.complete("r1", Some(token("r1")), Some("r2")),
            TokenOutcome::Stale
        );
        assert!(tc.held_room().is_none());
        assert_eq!(tc.pending_room(), Some("r2"));

        tc.complete("r2", Some(token("r2")), Some("r2"));
        assert_eq!(tc.held_room(), Some("r2"));
    }

    #[test]
    fn late_response_after_newer_commit_is_stale() {
        let mut tc = TokenCoordinator::new();
        tc.reconcile(Some("r1"));
        tc.reconcile(Some("r2"));
        tc.complete("r2", Some(token("r2")), Some("r2"));
        assert_eq!(
            tc.complete("r1", Some(token("r1")), Some("r2")),
            TokenOutcome::Stale
        );
        assert_eq!(tc.held_room(), Some("r2"));
    }

    #[test]
    fn failure_leaves_no_token_and_no_retry() {
        let mut tc = TokenCoordinator::new();
        tc.reconcile(Some("r1"));
        assert_eq!(tc.complete("r1", None, Some("r1")), TokenOutcome::Failed);
        assert!(tc.held().is_none());
        assert!(tc.pending_room().is_none());
    }

    #[test]
    fn duplicate_response_is_redundant() {
        let mut tc = TokenCoordinator::new();
        tc.reconcile(Some("r1"));
        tc.complete("r1", Some(token("r1")), Some("r1"));
        assert_eq!(
            tc.complete("r1", Some(token("r1")), Some("r1")),
            TokenOutcome::Redundant
        );
    }

    #[test]
    fn empty_room_in_response_is_filled_in() {
        let mut tc = TokenCoordinator::new();
        tc.reconcile(Some("r1"));
        let mut t = token("r1");
        t.room.clear();
        tc.complete("r1", Some(t), Some("r1"));
        assert_eq!(tc.held_room(), Some("r1"));
    }

    #[test]
    fn reset_drops_everything() {
        let mut tc = TokenCoordinator::new();
        tc.reconcile(Some("r1"));
        tc.complete("r1", Some(token("r1")), Some("r1"));
        tc.reconcile(Some("r2"));
        assert!(tc.reset().is_none());
        assert!(tc.pending_room().is_none());
    }
}
