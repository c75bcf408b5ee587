//! Runner configuration.
//!
//! The deployment layer passes configuration as JSON, either in the
//! `JOB_RUNNER_CONFIG` environment variable or in a file. Individual
//! directories can be overridden with `JOB_RUNNER_TEMP_DIR`,
//! `JOB_RUNNER_HOME_DIR` and `JOB_RUNNER_REPO_DIR`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::executor::ExecutorSettings;

const CONFIG_VAR: &str = "JOB_RUNNER_CONFIG";
const TEMP_DIR_VAR: &str = "JOB_RUNNER_TEMP_DIR";
const HOME_DIR_VAR: &str = "JOB_RUNNER_HOME_DIR";
const REPO_DIR_VAR: &str = "JOB_RUNNER_REPO_DIR";

/// Top-level configuration for the runner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunnerConfig {
    /// Scratch directory exposed to the job as `TMPDIR`.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Directory exposed to the job as `HOME`.
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    /// Directory the job's code is fetched into.
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,

    /// Seconds between SIGTERM and SIGKILL when stopping a job.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_seconds: u64,

    /// `git` executable used for clones.
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            home_dir: default_home_dir(),
            repo_dir: default_repo_dir(),
            kill_grace_seconds: default_kill_grace(),
            git_binary: default_git_binary(),
        }
    }
}

impl RunnerConfig {
    /// Load from `JOB_RUNNER_CONFIG`, falling back to defaults, then apply
    /// the per-directory overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_VAR) {
            Ok(json) => {
                Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_VAR}"))?
            }
            Err(_) => {
                debug!("{CONFIG_VAR} not set, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from a JSON file, then apply the per-directory overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid runner configuration")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        for (var, slot) in [
            (TEMP_DIR_VAR, &mut self.temp_dir),
            (HOME_DIR_VAR, &mut self.home_dir),
            (REPO_DIR_VAR, &mut self.repo_dir),
        ] {
            if let Some(dir) = std::env::var_os(var).filter(|v| !v.is_empty()) {
                *slot = PathBuf::from(dir);
            }
        }
    }

    /// Executor knobs derived from this config.
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            kill_grace: Duration::from_secs(self.kill_grace_seconds),
            git_binary: self.git_binary.clone(),
        }
    }
}

fn base_dir() -> PathBuf {
    std::env::temp_dir().join("job-runner")
}

fn default_temp_dir() -> PathBuf {
    base_dir().join("temp")
}

fn default_home_dir() -> PathBuf {
    base_dir().join("home")
}

fn default_repo_dir() -> PathBuf {
    base_dir().join("repo")
}

const fn default_kill_grace() -> u64 {
    2
}

fn default_git_binary() -> String {
    "git".into()
}
