//! Outcome taxonomy returned from [`crate::executor::Executor::run`].

use std::time::Duration;

use thiserror::Error;

use crate::state::JobState;

/// Why a job did not succeed, or why an operation was refused.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Code fetch, environment preparation or process start failed.
    /// No job process ran to completion.
    #[error("job setup failed: {reason}")]
    SetupFailed { reason: String },

    /// The job process exited with a non-zero code.
    #[error("job failed with exit code {exit_code}")]
    Failed { exit_code: i32 },

    /// The job outlived its maximum duration and was killed.
    #[error("job timed out after {}s", .after.as_secs())]
    TimedOut { after: Duration },

    /// The caller cancelled the run and the job was killed.
    #[error("job was cancelled")]
    Cancelled,

    /// The submitted job was rejected when binding it.
    #[error("invalid job: {reason}")]
    InvalidJob { reason: String },

    /// The requested operation is not allowed in the current state.
    #[error("cannot {operation} while job is {state}")]
    InvalidState {
        operation: &'static str,
        state: JobState,
    },
}

impl ExecutorError {
    /// Build a `SetupFailed` from any error, keeping its context chain.
    pub fn setup(err: impl Into<anyhow::Error>) -> Self {
        Self::SetupFailed {
            reason: format!("{:#}", err.into()),
        }
    }

    /// The terminal state this error corresponds to, if it is an outcome.
    pub const fn terminal_state(&self) -> Option<JobState> {
        match self {
            Self::SetupFailed { .. } => Some(JobState::SetupFailed),
            Self::Failed { .. } => Some(JobState::Failed),
            Self::TimedOut { .. } => Some(JobState::TimedOut),
            Self::Cancelled => Some(JobState::Cancelled),
            Self::InvalidJob { .. } | Self::InvalidState { .. } => None,
        }
    }
}
