use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an interactive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Process spawned, no output or input yet.
    Starting,
    /// Ready for, or working on, a command.
    Active,
    /// Completion heuristic fired; the pending command is being resolved.
    Completing,
    /// Process gone. Terminal state.
    Closed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Completing => "completing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}
