//! Single-shot job executor.
//!
//! An [`Executor`] owns three directories for the lifetime of one job and
//! drives it through fetch, environment setup and the command run. State
//! lives behind a mutex that is never held across an await, so
//! [`Executor::get_history`] and [`Executor::state`] can be called from
//! other tasks while [`Executor::run`] is in flight.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWrite;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelSignal;
use crate::env::{resolve_working_dir, EnvironmentBuilder};
use crate::error::ExecutorError;
use crate::fetch::{fetcher_for, FetchSettings};
use crate::output::{History, OutputRecorder};
use crate::runner::{CommandRunner, RunOutcome, RunRequest, DEFAULT_KILL_GRACE};
use crate::schemas::{FetchPlan, SubmitBody};
use crate::state::{JobState, JobStateEvent};

/// Tunables that do not come from the job itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Time between SIGTERM and SIGKILL when stopping the job.
    pub kill_grace: Duration,

    /// `git` executable used by the fetcher.
    pub git_binary: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
            git_binary: "git".into(),
        }
    }
}

/// Output and state transitions from a given offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistorySnapshot {
    pub job_states: Vec<JobStateEvent>,
    pub output: Vec<u8>,
    /// Pass back as the offset to continue without loss or duplication.
    pub next_offset: usize,
}

pub struct Executor {
    temp_dir: PathBuf,
    home_dir: PathBuf,
    repo_dir: PathBuf,
    settings: ExecutorSettings,
    history: Arc<History>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: JobState,
    body: Option<SubmitBody>,
    /// Set when the caller supplied the code location themselves.
    code_path: Option<PathBuf>,
    job_states: Vec<JobStateEvent>,
}

/// What `run` takes out of the state lock.
struct Prepared {
    body: SubmitBody,
    code_path: PathBuf,
    fetch: Option<FetchPlan>,
}

impl Executor {
    /// Create an executor owning the given directories.
    ///
    /// Missing directories are created. The three must be distinct.
    pub fn new(
        temp_dir: impl AsRef<Path>,
        home_dir: impl AsRef<Path>,
        repo_dir: impl AsRef<Path>,
    ) -> Result<Self, ExecutorError> {
        let temp_dir = prepare_dir(temp_dir.as_ref())?;
        let home_dir = prepare_dir(home_dir.as_ref())?;
        let repo_dir = prepare_dir(repo_dir.as_ref())?;

        if temp_dir == home_dir || temp_dir == repo_dir || home_dir == repo_dir {
            return Err(ExecutorError::SetupFailed {
                reason: format!(
                    "temp ({}), home ({}) and repo ({}) directories must be distinct",
                    temp_dir.display(),
                    home_dir.display(),
                    repo_dir.display()
                ),
            });
        }

        debug!(
            temp_dir = %temp_dir.display(),
            home_dir = %home_dir.display(),
            repo_dir = %repo_dir.display(),
            "Created executor"
        );

        Ok(Self {
            temp_dir,
            home_dir,
            repo_dir,
            settings: ExecutorSettings::default(),
            history: Arc::new(History::new()),
            inner: Mutex::new(Inner {
                state: JobState::Created,
                body: None,
                code_path: None,
                job_states: vec![JobStateEvent::now(JobState::Created)],
            }),
        })
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    /// Bind the job. Allowed until the run starts.
    pub fn set_job(&self, body: SubmitBody) -> Result<(), ExecutorError> {
        if body.job_spec.entrypoint.is_empty() {
            return Err(ExecutorError::InvalidJob {
                reason: "entrypoint is empty".into(),
            });
        }

        let mut inner = self.lock();
        guard_configurable(inner.state, "set job")?;

        info!(
            commands = body.job_spec.commands.len(),
            working_dir = %body.job_spec.working_dir,
            max_duration = body.job_spec.max_duration,
            "Job configured"
        );
        inner.body = Some(body);
        inner.transition(JobState::Configured);
        Ok(())
    }

    /// Point the job at code that is already on disk instead of `repo_dir`.
    ///
    /// The repository source of the job, if any, is then not fetched.
    pub fn set_code_path(&self, path: impl Into<PathBuf>) -> Result<(), ExecutorError> {
        let mut path = path.into();
        if path.is_relative() {
            let cwd = std::env::current_dir().map_err(ExecutorError::setup)?;
            path = cwd.join(path);
        }

        let mut inner = self.lock();
        guard_configurable(inner.state, "set code path")?;
        debug!(code_path = %path.display(), "Code path overridden");
        inner.code_path = Some(path);
        Ok(())
    }

    /// The code root the job runs against.
    pub fn code_path(&self) -> PathBuf {
        self.lock()
            .code_path
            .clone()
            .unwrap_or_else(|| self.repo_dir.clone())
    }

    /// The job's working directory, derived from the code path.
    pub fn working_dir(&self) -> Result<PathBuf, ExecutorError> {
        let inner = self.lock();
        let code_path = inner.code_path.as_ref().unwrap_or(&self.repo_dir);
        let working_dir = inner
            .body
            .as_ref()
            .map_or(".", |body| body.job_spec.working_dir.as_str());
        resolve_working_dir(code_path, working_dir).map_err(ExecutorError::setup)
    }

    /// Output recorded from `offset` onward plus every state transition.
    ///
    /// Safe to call at any time, including while `run` is in flight.
    pub fn get_history(&self, offset: usize) -> HistorySnapshot {
        let job_states = self.lock().job_states.clone();
        let chunk = self.history.read_from(offset);
        HistorySnapshot {
            job_states,
            output: chunk.data,
            next_offset: chunk.next_offset,
        }
    }

    /// Shared handle to the output history, for tailing.
    pub fn history(&self) -> Arc<History> {
        Arc::clone(&self.history)
    }

    /// Run the bound job to completion.
    ///
    /// Output goes to `live` as it is produced and into the history. Returns
    /// `Ok(())` only when the job exited with status 0.
    #[instrument(skip_all, fields(repo_dir = %self.repo_dir.display()))]
    pub async fn run<W>(&self, mut cancel: CancelSignal, live: &mut W) -> Result<(), ExecutorError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let prepared = self.begin()?;
        let mut abandoned = AbandonGuard {
            executor: self,
            armed: true,
        };
        let result = self.execute(prepared, &mut cancel, live).await;
        abandoned.armed = false;

        let final_state = match &result {
            Ok(()) => JobState::Succeeded,
            Err(err) => err.terminal_state().unwrap_or(JobState::SetupFailed),
        };
        self.history.close();
        self.lock().transition(final_state);

        match &result {
            Ok(()) => info!(output_bytes = self.history.len(), "Job succeeded"),
            Err(err) => warn!(error = %err, state = %final_state, "Job did not succeed"),
        }
        result
    }

    /// Move `Configured -> Running` and take what the run needs.
    fn begin(&self) -> Result<Prepared, ExecutorError> {
        let mut inner = self.lock();
        if inner.state != JobState::Configured {
            return Err(ExecutorError::InvalidState {
                operation: "run",
                state: inner.state,
            });
        }
        let Some(body) = inner.body.clone() else {
            return Err(ExecutorError::InvalidState {
                operation: "run",
                state: inner.state,
            });
        };

        let (code_path, fetch) = match &inner.code_path {
            Some(path) => (path.clone(), None),
            None => (
                self.repo_dir.clone(),
                body.repo.as_ref().and_then(|repo| repo.plan()),
            ),
        };

        inner.transition(JobState::Running);
        Ok(Prepared {
            body,
            code_path,
            fetch,
        })
    }

    async fn execute<W>(
        &self,
        prepared: Prepared,
        cancel: &mut CancelSignal,
        live: &mut W,
    ) -> Result<(), ExecutorError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let Prepared {
            body,
            code_path,
            fetch,
        } = prepared;

        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        if let Some(plan) = fetch {
            let fetcher = fetcher_for(
                plan,
                &FetchSettings {
                    git_binary: self.settings.git_binary.clone(),
                    scratch_dir: self.temp_dir.clone(),
                },
            );
            info!(source = %fetcher.describe(), "Fetching code");
            tokio::select! {
                fetched = fetcher.fetch(&self.repo_dir) => fetched.map_err(ExecutorError::setup)?,
                () = cancel.cancelled() => return Err(ExecutorError::Cancelled),
            }
        }

        let env = EnvironmentBuilder::new(&self.home_dir, &self.temp_dir)
            .build(&code_path, &body.job_spec, &body.secrets)
            .map_err(ExecutorError::setup)?;

        let request = RunRequest {
            entrypoint: &body.job_spec.entrypoint,
            commands: &body.job_spec.commands,
            env: &env,
            max_duration: body.job_spec.deadline(),
        };
        let recorder = OutputRecorder::new(Arc::clone(&self.history));
        let outcome = CommandRunner::new(self.settings.kill_grace)
            .run(request, &recorder, cancel, live)
            .await
            .map_err(ExecutorError::setup)?;

        match outcome {
            RunOutcome::Succeeded => Ok(()),
            RunOutcome::Failed { exit_code } => Err(ExecutorError::Failed { exit_code }),
            RunOutcome::TimedOut { after } => Err(ExecutorError::TimedOut { after }),
            RunOutcome::Cancelled => Err(ExecutorError::Cancelled),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("temp_dir", &self.temp_dir)
            .field("home_dir", &self.home_dir)
            .field("repo_dir", &self.repo_dir)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn transition(&mut self, state: JobState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Job state transition");
        self.state = state;
        self.job_states.push(JobStateEvent::now(state));
    }
}

/// Settles the job as cancelled if the `run` future is dropped mid-flight.
struct AbandonGuard<'a> {
    executor: &'a Executor,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Run dropped before completion, marking job cancelled");
            self.executor.history.close();
            self.executor.lock().transition(JobState::Cancelled);
        }
    }
}

fn guard_configurable(state: JobState, operation: &'static str) -> Result<(), ExecutorError> {
    if state.accepts_configuration() {
        Ok(())
    } else {
        Err(ExecutorError::InvalidState { operation, state })
    }
}

fn prepare_dir(dir: &Path) -> Result<PathBuf, ExecutorError> {
    std::fs::create_dir_all(dir)
        .and_then(|()| dir.canonicalize())
        .map_err(|e| ExecutorError::SetupFailed {
            reason: format!("cannot prepare directory {}: {e}", dir.display()),
        })
}
