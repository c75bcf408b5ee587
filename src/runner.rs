//! Job process runner.
//!
//! Spawns the entrypoint with the composed script, pumps its output through
//! an [`OutputRecorder`], and races process exit against the deadline and
//! the caller's cancellation signal.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelSignal;
use crate::env::JobEnvironment;
use crate::output::{OutputRecorder, Recording};

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// How a job process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed { exit_code: i32 },
    TimedOut { after: Duration },
    Cancelled,
}

/// The process could not be started.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("entrypoint is empty")]
    EmptyEntrypoint,

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for job process: {0}")]
    Wait(#[source] std::io::Error),
}

/// What to run.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub entrypoint: &'a [String],
    pub commands: &'a [String],
    pub env: &'a JobEnvironment,
    pub max_duration: Option<Duration>,
}

/// Compose the job's commands into the single script argument.
///
/// Commands are joined with newlines, so each runs regardless of the
/// previous one's status unless the script itself says otherwise (for
/// example `set -e`). The script's status is that of its last command.
pub fn compose_script(commands: &[String]) -> String {
    commands.join("\n")
}

/// Runs exactly one job process per call.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    kill_grace: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_GRACE)
    }
}

impl CommandRunner {
    pub const fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Run the job and wait until it has exited and its output is drained.
    ///
    /// A live sink that stops accepting writes gets `kill_grace` after the
    /// job ends and is then abandoned.
    #[instrument(
        skip_all,
        fields(
            program = request.entrypoint.first().map(String::as_str),
            commands = request.commands.len()
        )
    )]
    pub async fn run<W>(
        &self,
        request: RunRequest<'_>,
        recorder: &OutputRecorder,
        cancel: &mut CancelSignal,
        live: &mut W,
    ) -> Result<RunOutcome, SpawnError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let (program, prefix) = request
            .entrypoint
            .split_first()
            .ok_or(SpawnError::EmptyEntrypoint)?;

        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .arg(compose_script(request.commands))
            .current_dir(&request.env.working_dir)
            .env_clear()
            .envs(&request.env.vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so termination reaches every descendant
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            program: program.clone(),
            source,
        })?;
        info!(
            pid = child.id(),
            working_dir = %request.env.working_dir.display(),
            "Job process started"
        );

        let group = child.id();
        let mut abandoned = GroupGuard { group, armed: true };
        let (mut recording, live_feed) = recorder.start(child.stdout.take(), child.stderr.take());

        let supervise = self.supervise(&mut child, &mut recording, request.max_duration, cancel);
        let forward = live_feed.forward_to(live);
        tokio::pin!(supervise, forward);

        let mut forwarding = true;
        let outcome = loop {
            tokio::select! {
                outcome = &mut supervise => break outcome?,
                () = &mut forward, if forwarding => forwarding = false,
            }
        };
        abandoned.armed = false;

        // The job is over; the live consumer gets a bounded flush
        if forwarding && tokio::time::timeout(self.kill_grace, &mut forward).await.is_err() {
            warn!("Live output consumer stalled, dropping the rest of the live stream");
        }

        debug!(?outcome, "Job process finished");
        Ok(outcome)
    }

    /// Wait for the job to exit and its output to drain, or for the deadline
    /// or cancellation, whichever comes first.
    ///
    /// Descendants that keep the pipes open after the leader exits still count
    /// as the job running.
    async fn supervise(
        &self,
        child: &mut Child,
        recording: &mut Recording,
        max_duration: Option<Duration>,
        cancel: &mut CancelSignal,
    ) -> Result<RunOutcome, SpawnError> {
        let group = child.id();
        let deadline = async {
            match max_duration {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            status = async {
                let status = child.wait().await;
                recording.drain().await;
                status
            } => {
                let outcome = classify(status.map_err(SpawnError::Wait)?);
                // Sweep stragglers that detached from the pipes
                signal_group(group, true);
                return Ok(outcome);
            }
            () = deadline => {
                let after = max_duration.unwrap_or_default();
                warn!(after_secs = after.as_secs(), "Job exceeded its maximum duration");
                self.terminate(child).await;
                RunOutcome::TimedOut { after }
            }
            () = cancel.cancelled() => {
                info!("Job cancelled by caller");
                self.terminate(child).await;
                RunOutcome::Cancelled
            }
        };

        if tokio::time::timeout(self.kill_grace, recording.drain())
            .await
            .is_err()
        {
            warn!("Job output still open after termination, abandoning it");
            recording.abort();
        }
        Ok(outcome)
    }

    /// SIGTERM the process group, give it the grace period, then SIGKILL
    /// whatever is left and reap the child.
    async fn terminate(&self, child: &mut Child) {
        let group = child.id();

        signal_group(group, false);
        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
            debug!("Job did not exit within grace period");
        }

        // Sweep descendants that ignored SIGTERM or outlived the leader
        signal_group(group, true);
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Job process already gone");
        }
    }
}

/// SIGKILLs the job's process group if the run is dropped mid-flight.
struct GroupGuard {
    group: Option<u32>,
    armed: bool,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!(pgid = self.group, "Run abandoned, killing job process group");
            signal_group(self.group, true);
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, force: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = killpg(Pid::from_raw(pid), signal) {
        debug!(
            pgid = pid,
            signal = signal.as_str(),
            error = %e,
            "Failed to signal job process group"
        );
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _force: bool) {}

fn classify(status: ExitStatus) -> RunOutcome {
    match status.code() {
        Some(0) => RunOutcome::Succeeded,
        Some(exit_code) => RunOutcome::Failed { exit_code },
        None => RunOutcome::Failed {
            exit_code: signal_exit_code(status),
        },
    }
}

/// Shell convention for a process killed by a signal.
#[cfg(unix)]
fn signal_exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map_or(-1, |signal| 128 + signal)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: ExitStatus) -> i32 {
    -1
}
