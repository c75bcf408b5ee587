//! job-runner library
//!
//! Single-shot job execution engine:
//! - Fetching job code from git or a local archive
//! - Building an isolated working directory and environment
//! - Running the job's commands under timeout and cancellation control
//! - Recording output as a live stream and a replayable history

pub mod cancel;
pub mod config;
pub mod env;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod output;
pub mod runner;
pub mod schemas;
pub mod state;

pub use cancel::{cancellation, CancelHandle, CancelSignal};
pub use error::ExecutorError;
pub use executor::{Executor, ExecutorSettings, HistorySnapshot};
pub use schemas::{JobSpec, SubmitBody};
pub use state::JobState;
