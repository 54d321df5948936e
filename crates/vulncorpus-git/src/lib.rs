//! Git working-copy gateway.
//!
//! A `GitGateway` wraps one repository inside a scoped working directory.
//! The clone is deferred until an operation actually needs the working copy,
//! since cached version resolutions often make it unnecessary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

mod linguist;

#[derive(Debug, Error)]
pub enum GitError {
    /// The remote reports the repository is gone. Not retried.
    #[error("repository not found: {url}")]
    RepoNotFound { url: String },
    /// Any other git failure.
    #[error("git error: {0}")]
    Runtime(String),
    /// The language classifier failed.
    #[error("linguist error: {0}")]
    Linguist(String),
}

/// Seam between the conversion engine and git. The engine only ever needs
/// these two operations; tests substitute a scripted implementation.
pub trait RepoGateway {
    /// Resolve a version string to `(commit, authored timestamp)`.
    /// `Ok(None)` means git does not know the ref; that is not an error.
    fn resolve_version(&mut self, version: &str) -> Result<Option<(String, i64)>, GitError>;

    /// Language byte sizes of the tree at `commit`, plus their sum.
    fn measure_sizes(&mut self, commit: &str) -> Result<(BTreeMap<String, i64>, i64), GitError>;
}

pub struct GitGateway {
    repo_url: String,
    workdir: PathBuf,
    repo_dir: Option<PathBuf>,
    linguist_command: String,
}

impl GitGateway {
    /// Gateway over `repo_url`, cloning (lazily) inside `workdir`. The caller
    /// owns `workdir` and its cleanup; one conversion task, one workdir.
    pub fn new(repo_url: &str, workdir: &Path) -> Self {
        Self {
            repo_url: repo_url.to_string(),
            workdir: workdir.to_path_buf(),
            repo_dir: None,
            linguist_command: "github-linguist".to_string(),
        }
    }

    pub fn with_linguist_command(mut self, command: &str) -> Self {
        self.linguist_command = command.to_string();
        self
    }

    fn ensure_cloned(&mut self) -> Result<&Path, GitError> {
        if self.repo_dir.is_none() {
            let dest = self.workdir.join("repo");
            info!("cloning {} into {}", self.repo_url, dest.display());
            let output = Command::new("git")
                .args(["clone", "--quiet"])
                .arg(&self.repo_url)
                .arg(&dest)
                .output()
                .map_err(|e| GitError::Runtime(format!("failed to execute git clone: {e}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.to_lowercase().contains("repository not found") {
                    return Err(GitError::RepoNotFound {
                        url: self.repo_url.clone(),
                    });
                }
                return Err(GitError::Runtime(format!(
                    "git clone of {} failed: {}",
                    self.repo_url,
                    stderr.trim()
                )));
            }
            self.repo_dir = Some(dest);
        }
        Ok(self.repo_dir.as_deref().expect("repo_dir just set"))
    }

    /// Leave the working tree at `commit`.
    fn checkout(&mut self, commit: &str) -> Result<(), GitError> {
        let repo_dir = self.ensure_cloned()?.to_path_buf();
        let output = Command::new("git")
            .args(["checkout", "--force", "--quiet", commit])
            .current_dir(&repo_dir)
            .output()
            .map_err(|e| GitError::Runtime(format!("failed to execute git checkout: {e}")))?;
        if !output.status.success() {
            return Err(GitError::Runtime(format!(
                "git checkout of {commit} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn commit_date(&self, repo_dir: &Path, commit: &str) -> Result<i64, GitError> {
        let output = Command::new("git")
            .args(["log", "-1", "--format=%at", commit])
            .current_dir(repo_dir)
            .output()
            .map_err(|e| GitError::Runtime(format!("failed to execute git log: {e}")))?;
        if !output.status.success() {
            return Err(GitError::Runtime(format!(
                "git log for {commit} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| GitError::Runtime(format!("unparseable commit date for {commit}")))
    }
}

impl RepoGateway for GitGateway {
    fn resolve_version(&mut self, version: &str) -> Result<Option<(String, i64)>, GitError> {
        // A leading dash would be read as a flag by git; no real tag starts
        // with one.
        if version.starts_with('-') {
            return Ok(None);
        }
        let repo_dir = self.ensure_cloned()?.to_path_buf();
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{version}^{{commit}}"))
            .current_dir(&repo_dir)
            .output()
            .map_err(|e| GitError::Runtime(format!("failed to execute git rev-parse: {e}")))?;
        if !output.status.success() {
            debug!("version {version} not known to git");
            return Ok(None);
        }
        let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let date = self.commit_date(&repo_dir, &commit)?;
        Ok(Some((commit, date)))
    }

    fn measure_sizes(&mut self, commit: &str) -> Result<(BTreeMap<String, i64>, i64), GitError> {
        self.checkout(commit)?;
        let repo_dir = self.repo_dir.as_deref().expect("checkout ensures clone");
        linguist::measure(repo_dir, &self.linguist_command)
    }
}
