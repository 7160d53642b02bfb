use crate::models::{AgentState, AgentStatus};

/// Latest observed agent status for the connected session.
///
/// Updates are accepted as-is: which transitions are legal (error recovery,
/// thinking timeouts) is decided by the relay.
#[derive(Debug, Default)]
pub struct AgentStatusTracker {
    current: AgentStatus,
    last_auto_listen_seq: Option<u64>,
}

impl AgentStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &AgentStatus {
        &self.current
    }

    pub fn state(&self) -> AgentState {
        self.current.state
    }

    /// Overwrite the current status, returning the state it replaced.
    pub fn update(&mut self, status: AgentStatus) -> AgentState {
        std::mem::replace(&mut self.current, status).state
    }

    /// Forget the previous session's status. The auto-listen sequence is
    /// relay-wide and survives.
    pub fn reset(&mut self) {
        self.current = AgentStatus::default();
    }

    /// Returns true exactly once per new disable-auto-listen sequence number.
    pub fn observe_disable_auto_listen(&mut self, seq: u64) -> bool {
        match self.last_auto_listen_seq {
            Some(last) if seq <= last => false,
            _ => {
                self.last_auto_listen_seq = Some(seq);
                true
            }
        }
    }

    pub fn last_auto_listen_seq(&self) -> Option<u64> {
        self.last_auto_listen_seq
    }
}
