use std::sync::Arc;

use tracing::debug;

use crate::audio::{AudioContext, Cue, CueSink};
use crate::config::NotificationConfig;
use crate::models::AgentState;
use crate::registry::OnlineDiff;

/// Cue for an agent state change, if any.
pub fn cue_for_transition(prev: AgentState, next: AgentState) -> Option<Cue> {
    match (prev, next) {
        (AgentState::Speaking, AgentState::Idle) => Some(Cue::Ascending),
        (AgentState::Idle, AgentState::Thinking) => Some(Cue::Descending),
        _ => None,
    }
}

/// Join and leave cues fire independently.
pub fn cues_for_diff(diff: &OnlineDiff) -> Vec<Cue> {
    let mut cues = Vec::new();
    if !diff.joined.is_empty() {
        cues.push(Cue::SessionJoined);
    }
    if !diff.left.is_empty() {
        cues.push(Cue::SessionLeft);
    }
    cues
}

pub struct NotificationEngine {
    enabled: bool,
    sink: Arc<dyn CueSink>,
    context: &'static AudioContext,
}

impl NotificationEngine {
    pub fn new(config: &NotificationConfig, sink: Arc<dyn CueSink>) -> Self {
        Self::with_context(config, sink, AudioContext::global())
    }

    pub fn with_context(
        config: &NotificationConfig,
        sink: Arc<dyn CueSink>,
        context: &'static AudioContext,
    ) -> Self {
        Self {
            enabled: config.enabled,
            sink,
            context,
        }
    }

    pub fn unlock(&self) -> bool {
        self.context.ensure_unlocked()
    }

    pub fn on_status(&self, prev: AgentState, next: AgentState) -> Option<Cue> {
        let cue = cue_for_transition(prev, next)?;
        self.play(cue);
        Some(cue)
    }

    pub fn on_diff(&self, diff: &OnlineDiff) -> Vec<Cue> {
        let cues = cues_for_diff(diff);
        for cue in &cues {
            self.play(*cue);
        }
        cues
    }

    /// Returns whether the cue actually reached the sink.
    pub fn play(&self, cue: Cue) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.context.is_unlocked() {
            debug!("Audio output locked, dropping {} cue", cue.label());
            return false;
        }
        self.sink.play(cue, &cue.tones());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Tone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<Cue>>,
    }

    impl CueSink for RecordingSink {
        fn play(&self, cue: Cue, _tones: &[Tone]) {
            self.played.lock().unwrap().push(cue);
        }
    }

    fn engine(unlocked: bool) -> (NotificationEngine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let context: &'static AudioContext = Box::leak(Box::new(AudioContext::new()));
        if unlocked {
            context.ensure_unlocked();
        }
        let config = NotificationConfig {
            enabled: true,
            bell: false,
        };
        (
            NotificationEngine::with_context(&config, sink.clone(), context),
            sink,
        )
    }

    #[test]
    fn idle_thinking_speaking_idle_sequence() {
        use AgentState::*;
        let states = [Idle, Thinking, Speaking, Idle];
        let cues: Vec<Option<Cue>> = states
            .windows(2)
            .map(|w| cue_for_transition(w[0], w[1]))
            .collect();
        assert_eq!(cues, vec![Some(Cue::Descending), None, Some(Cue::Ascending)]);
    }

    #[test]
    fn other_transitions_are_silent() {
        use AgentState::*;
        for (a, b) in [
            (Idle, Speaking),
            (Thinking, Idle),
            (Error, Idle),
            (Speaking, Thinking),
            (Idle, Idle),
            (Thinking, Error),
        ] {
            assert_eq!(cue_for_transition(a, b), None, "{:?} -> {:?}", a, b);
        }
    }

    #[test]
    fn diff_can_fire_both_cues() {
        let diff = OnlineDiff {
            joined: vec!["a".into()],
            left: vec!["b".into()],
        };
        assert_eq!(
            cues_for_diff(&diff),
            vec![Cue::SessionJoined, Cue::SessionLeft]
        );
        assert!(cues_for_diff(&OnlineDiff::default()).is_empty());
    }

    #[test]
    fn locked_context_drops_cues() {
        let (engine, sink) = engine(false);
        assert!(!engine.play(Cue::Ascending));
        assert!(sink.played.lock().unwrap().is_empty());

        assert!(engine.unlock());
        assert!(!engine.unlock());
        engine.on_status(AgentState::Speaking, AgentState::Idle);
        assert_eq!(*sink.played.lock().unwrap(), vec![Cue::Ascending]);
    }

    #[test]
    fn status_sequence_reaches_sink_in_order() {
        let (engine, sink) = engine(true);
        engine.on_status(AgentState::Idle, AgentState::Thinking);
        engine.on_status(AgentState::Thinking, AgentState::Speaking);
        engine.on_status(AgentState::Speaking, AgentState::Idle);
        assert_eq!(
            *sink.played.lock().unwrap(),
            vec![Cue::Descending, Cue::Ascending]
        );
    }

    #[test]
    fn disabled_engine_plays_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let context: &'static AudioContext = Box::leak(Box::new(AudioContext::new()));
        context.ensure_unlocked();
        let config = NotificationConfig {
            enabled: false,
            bell: true,
        };
        let engine = NotificationEngine::with_context(&config, sink.clone(), context);
        assert!(!engine.play(Cue::SessionJoined));
        assert!(sink.played.lock().unwrap().is_empty());
    }
}
