//! Job submission types.
//!
//! These mirror the JSON accepted by the submission layer. Field names are
//! snake_case on the wire.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Declarative description of what to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Shell commands, run in order as one script.
    #[serde(default)]
    pub commands: Vec<String>,

    /// Fixed argv prefix, e.g. `["/bin/bash", "-c"]`.
    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// Extra environment for the job process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Maximum run time in seconds. Zero means unbounded.
    #[serde(default)]
    pub max_duration: u64,

    /// Working directory relative to the code root.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

impl JobSpec {
    /// The deadline for the job process, if any.
    pub const fn deadline(&self) -> Option<Duration> {
        if self.max_duration == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_duration))
        }
    }
}

fn default_working_dir() -> String {
    ".".into()
}

/// Everything the submission layer hands to an executor.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SubmitBody {
    pub job_spec: JobSpec,

    /// Environment overrides that win over `job_spec.env`.
    /// Only ever passed to the child process environment.
    #[serde(default)]
    pub secrets: HashMap<String, String>,

    /// Where the job's code comes from. Absent means the code root is
    /// used as-is.
    #[serde(default)]
    pub repo: Option<RepoSource>,
}

impl fmt::Debug for SubmitBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secret_names: Vec<_> = self.secrets.keys().collect();
        secret_names.sort();
        f.debug_struct("SubmitBody")
            .field("job_spec", &self.job_spec)
            .field("secrets", &secret_names)
            .field("repo", &self.repo)
            .finish()
    }
}

/// Source descriptor for the job's code.
///
/// Several fields may be present; [`RepoSource::plan`] picks one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSource {
    #[serde(default)]
    pub git: Option<GitRepoData>,

    #[serde(default)]
    pub credentials: Option<RepoCredentials>,

    /// Path to a tar archive of the code, uploaded out of band.
    #[serde(default)]
    pub archive: Option<PathBuf>,
}

/// How the fetcher will materialize a [`RepoSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPlan {
    AuthenticatedGit {
        repo: GitRepoData,
        credentials: RepoCredentials,
    },
    PublicGit(GitRepoData),
    Archive(PathBuf),
}

impl RepoSource {
    /// Select the materialization mode.
    ///
    /// Authenticated git wins over public git, which wins over an archive.
    pub fn plan(&self) -> Option<FetchPlan> {
        match (&self.git, &self.credentials, &self.archive) {
            (Some(repo), Some(credentials), _) => Some(FetchPlan::AuthenticatedGit {
                repo: repo.clone(),
                credentials: credentials.clone(),
            }),
            (Some(repo), None, _) => Some(FetchPlan::PublicGit(repo.clone())),
            (None, _, Some(archive)) => Some(FetchPlan::Archive(archive.clone())),
            (None, _, None) => None,
        }
    }
}

/// A git reference to clone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRepoData {
    pub url: String,

    #[serde(default)]
    pub branch: Option<String>,

    /// Commit to check out after cloning.
    #[serde(default)]
    pub hash: Option<String>,

    /// Uncommitted changes to apply on top, as a unified diff.
    #[serde(default)]
    pub diff: Option<String>,
}

/// Credentials for an authenticated clone.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum RepoCredentials {
    Https { oauth_token: String },
    Ssh { private_key: String },
}

impl fmt::Debug for RepoCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Https { .. } => f.write_str("Https { oauth_token: <redacted> }"),
            Self::Ssh { .. } => f.write_str("Ssh { private_key: <redacted> }"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(url: &str) -> GitRepoData {
        GitRepoData {
            url: url.to_string(),
            ..GitRepoData::default()
        }
    }

    #[test]
    fn parse_submit_body_with_defaults() {
        let json = r#"{
            "job_spec": {
                "commands": ["pwd"],
                "entrypoint": ["/bin/bash", "-c"]
            }
        }"#;

        let body: SubmitBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.job_spec.commands, vec!["pwd"]);
        assert_eq!(body.job_spec.working_dir, ".");
        assert_eq!(body.job_spec.max_duration, 0);
        assert!(body.job_spec.deadline().is_none());
        assert!(body.secrets.is_empty());
        assert!(body.repo.is_none());
    }

    #[test]
    fn parse_credentials() {
        let json = r#"{"protocol": "https", "oauth_token": "abc"}"#;
        let creds: RepoCredentials = serde_json::from_str(json).unwrap();
        assert_eq!(
            creds,
            RepoCredentials::Https {
                oauth_token: "abc".to_string()
            }
        );
    }

    #[test]
    fn debug_output_hides_secret_values() {
        let mut body = SubmitBody::default();
        body.secrets.insert("API_KEY".into(), "hunter2".into());
        body.repo = Some(RepoSource {
            git: Some(git("https://example.com/r.git")),
            credentials: Some(RepoCredentials::Ssh {
                private_key: "-----BEGIN KEY-----".into(),
            }),
            archive: None,
        });

        let rendered = format!("{body:?}");
        assert!(rendered.contains("API_KEY"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("BEGIN KEY"));
    }

    #[test]
    fn plan_prefers_authenticated_git() {
        let source = RepoSource {
            git: Some(git("https://example.com/r.git")),
            credentials: Some(RepoCredentials::Https {
                oauth_token: "t".into(),
            }),
            archive: Some(PathBuf::from("/tmp/code.tar")),
        };
        assert!(matches!(
            source.plan(),
            Some(FetchPlan::AuthenticatedGit { .. })
        ));
    }

    #[test]
    fn plan_public_git_over_archive() {
        let source = RepoSource {
            git: Some(git("https://example.com/r.git")),
            credentials: None,
            archive: Some(PathBuf::from("/tmp/code.tar")),
        };
        assert_eq!(
            source.plan(),
            Some(FetchPlan::PublicGit(git("https://example.com/r.git")))
        );
    }

    #[test]
    fn plan_archive_and_empty() {
        let source = RepoSource {
            archive: Some(PathBuf::from("/tmp/code.tar")),
            ..RepoSource::default()
        };
        assert_eq!(
            source.plan(),
            Some(FetchPlan::Archive(PathBuf::from("/tmp/code.tar")))
        );

        // Credentials alone select nothing
        let source = RepoSource {
            credentials: Some(RepoCredentials::Https {
                oauth_token: "t".into(),
            }),
            ..RepoSource::default()
        };
        assert!(source.plan().is_none());
    }
}
