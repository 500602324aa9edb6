//! Run-loop state machine shared by the coordinator and agents.

use serde::{Deserialize, Serialize};

/// Lifecycle of a run loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Not running. Initial and terminal.
    #[default]
    Shutdown,
    /// Processing messages and ticks.
    Running,
    /// Winding down; no new work is accepted.
    Shutting,
}

impl RunState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: RunState) -> bool {
        use RunState::*;

        matches!(
            (self, target),
            (Shutdown, Running) | (Running, Shutting) | (Shutting, Running) |
            (Running, Shutdown) | (Shutting, Shutdown)
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Shutdown => "shutdown",
            Self::Running => "running",
            Self::Shutting => "shutting",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(RunState::Shutdown.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Shutting));
        assert!(RunState::Shutting.can_transition_to(RunState::Shutdown));
        assert!(RunState::Running.can_transition_to(RunState::Shutdown));

        assert!(!RunState::Shutdown.can_transition_to(RunState::Shutting));
        assert!(!RunState::Running.can_transition_to(RunState::Running));
    }

    #[test]
    fn test_display() {
        assert_eq!(RunState::Shutting.to_string(), "shutting");
        assert_eq!(RunState::default(), RunState::Shutdown);
    }
}
