//! Post-event reconciliation.
//!
//! After every handled event the engine captures a [`Snapshot`] and asks
//! [`plan`] what follow-up work the change implies. `plan` is pure; the
//! engine executes the effects.

use crate::models::{AgentState, ConnectionState};
use crate::registry::OnlineDiff;

/// The inputs reactions depend on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub connection: ConnectionState,
    pub connected_session: Option<String>,
    pub sessions_revision: u64,
    pub sessions_populated: bool,
    /// Online ids in server order.
    pub online: Vec<String>,
    pub held_room: Option<String>,
    pub agent_state: AgentState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ConnectionChanged(ConnectionState),
    ConnectedSessionChanged(Option<String>),
    /// Load persisted history for a newly connected session.
    Hydrate(String),
    ReconcileToken,
    /// Online set changed after the first population.
    OnlineChanged(OnlineDiff),
    StatusChanged { prev: AgentState, next: AgentState },
}

pub fn plan(prev: &Snapshot, next: &Snapshot) -> Vec<Effect> {
    let mut effects = Vec::new();

    if prev.connection != next.connection {
        effects.push(Effect::ConnectionChanged(next.connection));
    }

    let session_changed = prev.connected_session != next.connected_session;
    if session_changed {
        effects.push(Effect::ConnectedSessionChanged(next.connected_session.clone()));
        if let Some(id) = &next.connected_session {
            effects.push(Effect::Hydrate(id.clone()));
        }
    }

    if session_changed
        || prev.sessions_revision != next.sessions_revision
        || prev.held_room != next.held_room
    {
        effects.push(Effect::ReconcileToken);
    }

    if prev.sessions_populated && prev.online != next.online {
        let diff = OnlineDiff::between(&prev.online, &next.online);
        if !diff.is_empty() {
            effects.push(Effect::OnlineChanged(diff));
        }
    }

    // a new session's status is not a transition of the old one
    if !session_changed && prev.agent_state != next.agent_state {
        effects.push(Effect::StatusChanged {
            prev: prev.agent_state,
            next: next.agent_state,
        });
    }

    effects
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Snapshot {
        Snapshot {
            connection: ConnectionState::Connected,
            connected_session: Some("a".into()),
            sessions_revision: 3,
            sessions_populated: true,
            online: vec!["a".into(), "b".into()],
            held_room: Some("r1".into()),
            agent_state: AgentState::Idle,
        }
    }

    #[test]
    fn unchanged_snapshot_plans_nothing() {
        assert!(plan(&base(), &base()).is_empty());
    }

    #[test]
    fn session_switch_hydrates_and_reconciles() {
        let next = Snapshot {
            connected_session: Some("b".into()),
            ..base()
        };
        assert_eq!(
            plan(&base(), &next),
            vec![
                Effect::ConnectedSessionChanged(Some("b".into())),
                Effect::Hydrate("b".into()),
                Effect::ReconcileToken,
            ]
        );
    }

    #[test]
    fn detaching_reconciles_without_hydrate() {
        let next = Snapshot {
            connected_session: None,
            ..base()
        };
        assert_eq!(
            plan(&base(), &next),
            vec![
                Effect::ConnectedSessionChanged(None),
                Effect::ReconcileToken
            ]
        );
    }

    #[test]
    fn sessions_frame_or_token_commit_reconciles() {
        let next = Snapshot {
            sessions_revision: 4,
            ..base()
        };
        assert_eq!(plan(&base(), &next), vec![Effect::ReconcileToken]);

        let next = Snapshot {
            held_room: None,
            ..base()
        };
        assert_eq!(plan(&base(), &next), vec![Effect::ReconcileToken]);
    }

    #[test]
    fn status_change_is_reported_with_both_states() {
        let next = Snapshot {
            agent_state: AgentState::Thinking,
            ..base()
        };
        assert_eq!(
            plan(&base(), &next),
            vec![Effect::StatusChanged {
                prev: AgentState::Idle,
                next: AgentState::Thinking
            }]
        );
    }

    #[test]
    fn channel_drop_reports_connection_first() {
        let next = Snapshot {
            connection: ConnectionState::Disconnected,
            connected_session: None,
            ..base()
        };
        let effects = plan(&base(), &next);
        assert_eq!(
            effects[0],
            Effect::ConnectionChanged(ConnectionState::Disconnected)
        );
        assert!(effects.contains(&Effect::ReconcileToken));
    }

    #[test]
    fn status_change_alongside_session_switch_is_not_a_transition() {
        let prev = Snapshot {
            agent_state: AgentState::Speaking,
            ..base()
        };
        let next = Snapshot {
            connected_session: Some("b".into()),
            agent_state: AgentState::Idle,
            ..base()
        };
        assert!(
            !plan(&prev, &next)
                .iter()
                .any(|e| matches!(e, Effect::StatusChanged { .. }))
        );
    }

    #[test]
    fn online_changes_are_planned_after_first_population() {
        let next = Snapshot {
            sessions_revision: 4,
            online: vec!["b".into(), "c".into()],
            ..base()
        };
        assert_eq!(
            plan(&base(), &next),
            vec![
                Effect::ReconcileToken,
                Effect::OnlineChanged(OnlineDiff {
                    joined: vec!["c".into()],
                    left: vec!["a".into()],
                }),
            ]
        );

        // first frame: no cues even though everything "joined"
        let unpopulated = Snapshot {
            sessions_populated: false,
            online: Vec::new(),
            ..base()
        };
        assert_eq!(plan(&unpopulated, &next), vec![Effect::ReconcileToken]);
    }

    #[test]
    fn reordering_online_sessions_is_silent() {
        let next = Snapshot {
            sessions_revision: 4,
            online: vec!["b".into(), "a".into()],
            ..base()
        };
        assert_eq!(plan(&base(), &next), vec![Effect::ReconcileToken]);
    }
}
