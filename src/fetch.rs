//! Repository fetchers.
//!
//! Fetchers materialize a job's code into a local directory. They never run
//! job commands; the git fetcher only drives the `git` binary.

mod archive;
mod git;

pub use archive::ArchiveFetcher;
pub use git::GitFetcher;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::schemas::FetchPlan;

/// Trait for code sources.
///
/// `fetch` is called at most once per executor, with `dest` already
/// existing. Failures are reported, never retried.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Populate `dest` with the job's code.
    async fn fetch(&self, dest: &Path) -> Result<()>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

/// Knobs shared by the fetchers.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// `git` executable to invoke.
    pub git_binary: String,

    /// Scratch space for credential material during a clone.
    pub scratch_dir: PathBuf,
}

/// Build the fetcher for a plan.
pub fn fetcher_for(plan: FetchPlan, settings: &FetchSettings) -> Box<dyn RepoFetcher> {
    match plan {
        FetchPlan::AuthenticatedGit { repo, credentials } => {
            Box::new(GitFetcher::new(repo, Some(credentials), settings))
        }
        FetchPlan::PublicGit(repo) => Box::new(GitFetcher::new(repo, None, settings)),
        FetchPlan::Archive(path) => Box::new(ArchiveFetcher::new(path)),
    }
}
