//! Lifecycle states, errors and stop results of a supervised process.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendError;

/// Lifecycle of one supervised subprocess.
///
/// ```text
/// stopped -> starting -> running -> stopping -> stopped
///              |            |
///              +-- (exit) --+--> stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ProcessState {
    /// Whether a subprocess is (being) launched.
    pub fn is_active(self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }

    /// Check whether `from -> to` is an edge of the lifecycle graph.
    pub fn is_valid_transition(from: ProcessState, to: ProcessState) -> bool {
        matches!(
            (from, to),
            (ProcessState::Stopped, ProcessState::Starting)
                | (ProcessState::Starting, ProcessState::Running)
                | (ProcessState::Starting, ProcessState::Stopped)
                | (ProcessState::Starting, ProcessState::Stopping)
                | (ProcessState::Running, ProcessState::Stopping)
                | (ProcessState::Running, ProcessState::Stopped)
                | (ProcessState::Stopping, ProcessState::Stopped)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Errors returned by [`super::Supervisor`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("agent is already running")]
    AlreadyRunning,

    #[error("agent is not running")]
    NotRunning,

    #[error("agent is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to prepare working directory {}: {source}", .path.display())]
    WorkingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program} -- is it installed and on PATH?: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("subprocess has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("failed to write to agent stdin: {0}")]
    Stdin(#[source] std::io::Error),
}

/// How the last subprocess ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// `None` when killed by a signal or the status was unavailable.
    pub code: Option<i32>,
    /// Whether the process had to be force-killed.
    pub forced: bool,
}

/// Result of a successful stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    /// Whether there was a process to signal at all.
    pub had_process: bool,
    /// Exited within the timeout after the termination signal.
    pub graceful: bool,
    pub forced: bool,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        use ProcessState::*;
        assert!(ProcessState::is_valid_transition(Stopped, Starting));
        assert!(ProcessState::is_valid_transition(Starting, Running));
        assert!(ProcessState::is_valid_transition(Running, Stopping));
        assert!(ProcessState::is_valid_transition(Stopping, Stopped));
        assert!(ProcessState::is_valid_transition(Running, Stopped));
    }

    #[test]
    fn invalid_transitions() {
        use ProcessState::*;
        assert!(!ProcessState::is_valid_transition(Stopped, Running));
        assert!(!ProcessState::is_valid_transition(Stopped, Stopping));
        assert!(!ProcessState::is_valid_transition(Stopping, Running));
        assert!(!ProcessState::is_valid_transition(Running, Starting));
    }

    #[test]
    fn display_and_serde_agree() {
        for state in [
            ProcessState::Stopped,
            ProcessState::Starting,
            ProcessState::Running,
            ProcessState::Stopping,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }
}
