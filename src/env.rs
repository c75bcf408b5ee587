//! Job process environment.
//!
//! Derives the working directory and the full environment for the job
//! process. Nothing here touches the daemon's own environment or cwd; the
//! result is handed to the spawn call explicitly.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::schemas::JobSpec;

/// Home directory variable, always forced to the executor's home dir.
pub const HOME_VAR: &str = "HOME";

/// Temp directory variable, always forced to the executor's temp dir.
pub const TEMP_VAR: &str = "TMPDIR";

/// Shells report `$PWD` from `pwd` when it matches the real cwd.
const PWD_VAR: &str = "PWD";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("working directory '{working_dir}' escapes the code path {}", .code_path.display())]
    EscapesCodePath {
        working_dir: String,
        code_path: PathBuf,
    },

    #[error("working directory '{0}' must be relative to the code path")]
    AbsoluteWorkingDir(String),

    #[error("working directory {} does not exist", .0.display())]
    MissingWorkingDir(PathBuf),

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("cannot resolve {}: {reason}", .path.display())]
    Unresolvable { path: PathBuf, reason: String },
}

/// Everything the runner needs to place the job process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEnvironment {
    pub working_dir: PathBuf,
    pub home_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub vars: BTreeMap<String, String>,
}

/// Builds a [`JobEnvironment`] on top of a base environment.
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    home_dir: PathBuf,
    temp_dir: PathBuf,
    base_env: BTreeMap<String, String>,
}

impl EnvironmentBuilder {
    /// Start from the daemon's inherited environment.
    ///
    /// Variables with non UTF-8 names or values are skipped.
    pub fn new(home_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        let base_env = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self {
            home_dir: home_dir.into(),
            temp_dir: temp_dir.into(),
            base_env,
        }
    }

    /// Replace the base environment.
    #[must_use]
    pub fn with_base_env(mut self, base_env: BTreeMap<String, String>) -> Self {
        self.base_env = base_env;
        self
    }

    /// Resolve the working directory and merge the environment.
    ///
    /// Precedence, lowest to highest: base env, job env, secrets, then the
    /// forced `HOME`/`TMPDIR`/`PWD` values.
    pub fn build(
        &self,
        code_path: &Path,
        job: &JobSpec,
        secrets: &HashMap<String, String>,
    ) -> Result<JobEnvironment, EnvError> {
        let working_dir = resolve_working_dir(code_path, &job.working_dir)?;
        if !working_dir.exists() {
            return Err(EnvError::MissingWorkingDir(working_dir));
        }
        if !working_dir.is_dir() {
            return Err(EnvError::NotADirectory(working_dir));
        }
        ensure_contained(code_path, &working_dir, &job.working_dir)?;

        let mut vars = self.base_env.clone();
        vars.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.extend(secrets.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.insert(HOME_VAR.into(), self.home_dir.to_string_lossy().into_owned());
        vars.insert(TEMP_VAR.into(), self.temp_dir.to_string_lossy().into_owned());
        vars.insert(PWD_VAR.into(), working_dir.to_string_lossy().into_owned());

        debug!(
            working_dir = %working_dir.display(),
            job_vars = job.env.len(),
            secret_vars = secrets.len(),
            "Built job environment"
        );

        Ok(JobEnvironment {
            working_dir,
            home_dir: self.home_dir.clone(),
            temp_dir: self.temp_dir.clone(),
            vars,
        })
    }
}

/// Join `working_dir` onto `code_path`, normalizing `.` and `..` lexically.
///
/// The result is always at or beneath `code_path`; anything that would
/// climb out of it is an error rather than being clamped.
pub fn resolve_working_dir(code_path: &Path, working_dir: &str) -> Result<PathBuf, EnvError> {
    let mut resolved = code_path.to_path_buf();
    let mut depth = 0usize;

    for component in Path::new(working_dir).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(EnvError::EscapesCodePath {
                        working_dir: working_dir.to_string(),
                        code_path: code_path.to_path_buf(),
                    });
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(EnvError::AbsoluteWorkingDir(working_dir.to_string()));
            }
        }
    }

    Ok(resolved)
}

/// Symlinks inside the code tree must not lead the working directory out
/// of it. The job still sees the configured path, not the resolved one.
fn ensure_contained(code_path: &Path, resolved: &Path, working_dir: &str) -> Result<(), EnvError> {
    let physical_root = canonical(code_path)?;
    let physical = canonical(resolved)?;
    if physical.starts_with(&physical_root) {
        return Ok(());
    }
    Err(EnvError::EscapesCodePath {
        working_dir: working_dir.to_string(),
        code_path: code_path.to_path_buf(),
    })
}

fn canonical(path: &Path) -> Result<PathBuf, EnvError> {
    path.canonicalize().map_err(|e| EnvError::Unresolvable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
