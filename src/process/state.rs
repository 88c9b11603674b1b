//! The per-service state machine.

/// Lifecycle state of a managed child process.
///
/// Transitions are linear and single-writer:
///
/// ```text
/// stopped ─start─► starting ─spawn ok─► running ─stop─► stopping ─exit─► stopped
///            │                  │            │
///            │                  └─spawn err─► failed
///            │                                  ▲
///            └── unexpected exit while running ─┘
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ProcessState {
    /// Whether `start` is legal from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether `stop` has anything to do in this state.
    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(ProcessState::Stopped.to_string(), "stopped");
        assert_eq!(ProcessState::Starting.to_string(), "starting");
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Stopping.to_string(), "stopping");
        assert_eq!(ProcessState::Failed.to_string(), "failed");
    }

    #[test]
    fn start_is_only_legal_when_idle() {
        assert!(ProcessState::Stopped.can_start());
        assert!(ProcessState::Failed.can_start());
        assert!(!ProcessState::Running.can_start());
        assert!(!ProcessState::Starting.can_start());
        assert!(!ProcessState::Stopping.can_start());
    }
}
