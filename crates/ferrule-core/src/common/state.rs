//! Server lifecycle states.

use serde::Serialize;
use std::fmt;

/// Where a server is in its one-way lifecycle.
///
/// `NotStarted → Serving → Stopping → Stopped`. A server that was never
/// started may be stopped directly. Nothing leaves `Stopped`; a new server
/// has to be built to serve again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    NotStarted,
    Serving,
    Stopping,
    Stopped,
}

impl ServerState {
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (NotStarted, Serving)
                | (NotStarted, Stopped)
                | (Serving, Stopping)
                | (Serving, Stopped)
                | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ServerState::Stopped
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Serving => "serving",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ServerState::*;

    #[test]
    fn forward_only() {
        assert!(NotStarted.can_transition_to(Serving));
        assert!(Serving.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(NotStarted.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Serving));
        assert!(!Stopped.can_transition_to(NotStarted));
        assert!(!Stopping.can_transition_to(Serving));
        assert!(!Serving.can_transition_to(NotStarted));
        assert!(!Serving.can_transition_to(Serving));
    }

    #[test]
    fn only_stopped_is_terminal() {
        assert!(Stopped.is_terminal());
        assert!(!Stopping.is_terminal());
    }
}
