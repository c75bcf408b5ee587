//! job-runner
//!
//! Runs one submitted job and streams its output to stdout.
//! Logs go to stderr so stdout carries only job output.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use job_runner::{cancellation, config::RunnerConfig, Executor, ExecutorError, SubmitBody};

#[derive(Parser, Debug)]
#[command(name = "job-runner")]
#[command(about = "Run a single job: fetch code, run commands, stream output")]
struct Args {
    /// JSON submission (`job_spec`, `secrets`, optional `repo`)
    #[arg(long)]
    submit: PathBuf,

    /// JSON runner config (defaults to `JOB_RUNNER_CONFIG` or built-ins)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against code already on disk instead of fetching it
    #[arg(long)]
    code_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => RunnerConfig::from_file(path)?,
        None => RunnerConfig::from_env().context("Failed to load configuration")?,
    };

    let submit = tokio::fs::read_to_string(&args.submit)
        .await
        .with_context(|| format!("Failed to read submission {}", args.submit.display()))?;
    let body: SubmitBody = serde_json::from_str(&submit).context("Failed to parse submission")?;

    let executor = Executor::new(&config.temp_dir, &config.home_dir, &config.repo_dir)?
        .with_settings(config.executor_settings());
    executor.set_job(body)?;
    if let Some(code_path) = args.code_path {
        executor.set_code_path(code_path)?;
    }

    let (cancel_handle, cancel) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling job");
            cancel_handle.cancel();
        }
    });

    let mut stdout = tokio::io::stdout();
    let result = executor.run(cancel, &mut stdout).await;
    if let Err(e) = stdout.flush().await {
        warn!(error = %e, "Failed to flush job output");
    }

    Ok(match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            warn!(error = %err, "Job finished unsuccessfully");
            exit_code(&err)
        }
    })
}

/// Mirror the job outcome in our own exit status.
fn exit_code(err: &ExecutorError) -> ExitCode {
    match err {
        ExecutorError::Failed { exit_code } => {
            ExitCode::from(u8::try_from(*exit_code).ok().filter(|c| *c != 0).unwrap_or(1))
        }
        ExecutorError::TimedOut { .. } => ExitCode::from(124),
        ExecutorError::Cancelled => ExitCode::from(130),
        ExecutorError::SetupFailed { .. }
        | ExecutorError::InvalidJob { .. }
        | ExecutorError::InvalidState { .. } => ExitCode::from(2),
    }
}
