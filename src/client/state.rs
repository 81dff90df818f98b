//! Client lifecycle states

use serde::Serialize;
use std::fmt;

/// Lifecycle of one engine instance
///
/// Transitions only move forward:
/// `Starting -> Running -> Stopping -> {Stopped | Crashed}`.
/// `Crashed` can be entered from any live state when the process exits on
/// its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ClientState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;
        match (self, next) {
            (Starting, Running) | (Running, Stopping) => true,
            // A client that never came up can still be torn down
            (Starting, Stopping) => true,
            (Stopping, Stopped) | (Stopping, Crashed) => true,
            (Starting | Running, Crashed) => true,
            _ => false,
        }
    }

    /// Whether the process is (supposed to be) alive
    pub fn is_live(self) -> bool {
        matches!(self, ClientState::Starting | ClientState::Running)
    }

    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, ClientState::Stopped | ClientState::Crashed)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Starting => "starting",
            ClientState::Running => "running",
            ClientState::Stopping => "stopping",
            ClientState::Stopped => "stopped",
            ClientState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::ClientState::*;
    use super::*;

    const ALL: [ClientState; 5] = [Starting, Running, Stopping, Stopped, Crashed];

    #[test]
    fn test_forward_path() {
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopping.can_transition_to(Crashed));
    }

    #[test]
    fn test_crash_from_live_states() {
        assert!(Starting.can_transition_to(Crashed));
        assert!(Running.can_transition_to(Crashed));
    }

    #[test]
    fn test_no_backward_edges() {
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Running));
        for next in ALL {
            assert!(!Stopped.can_transition_to(next));
            assert!(!Crashed.can_transition_to(next));
        }
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![Stopped, Crashed]);
    }
}
