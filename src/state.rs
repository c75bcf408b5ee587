//! Executor lifecycle states.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where an executor is in its one-shot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Configured,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    SetupFailed,
}

impl JobState {
    /// Terminal states never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled | Self::SetupFailed
        )
    }

    /// Whether the job may still be (re)configured.
    pub const fn accepts_configuration(self) -> bool {
        matches!(self, Self::Created | Self::Configured)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::SetupFailed => "setup_failed",
        };
        f.write_str(name)
    }
}

/// A recorded state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStateEvent {
    pub state: JobState,
    pub timestamp: DateTime<Utc>,
}

impl JobStateEvent {
    pub fn now(state: JobState) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        for state in [
            JobState::Succeeded,
            JobState::Failed,
            JobState::TimedOut,
            JobState::Cancelled,
            JobState::SetupFailed,
        ] {
            assert!(state.is_terminal(), "{state} should be terminal");
            assert!(!state.accepts_configuration());
        }
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Running.accepts_configuration());
        assert!(JobState::Created.accepts_configuration());
        assert!(JobState::Configured.accepts_configuration());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&JobState::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        assert_eq!(JobState::SetupFailed.to_string(), "setup_failed");
    }
}
