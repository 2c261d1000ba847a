//! Shallow checkouts of test repositories.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("`git {args}` exited with {status}: {stderr}")]
    Command {
        args: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("git printed an invalid commit hash: {0:?}")]
    InvalidHash(String),
}

/// A checked-out repository, removed from disk on drop.
#[derive(Debug)]
pub struct Checkout {
    dir: TempDir,
    commit_hash: String,
}

impl Checkout {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn commit_hash(&self) -> &str {
        &self.commit_hash
    }

    /// Wrap an existing directory, used by stub sources.
    pub fn from_dir(dir: TempDir, commit_hash: impl Into<String>) -> Self {
        Self {
            dir,
            commit_hash: commit_hash.into(),
        }
    }
}

/// Source of repository checkouts.
#[async_trait]
pub trait RepoSource: Send + Sync {
    async fn checkout(&self, repo: &str, branch: &str) -> Result<Checkout, GitError>;
}

/// Clones with the `git` binary at depth one.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new(&self.binary)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(GitError::Command {
                args: args.join(" "),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl RepoSource for GitCli {
    async fn checkout(&self, repo: &str, branch: &str) -> Result<Checkout, GitError> {
        let dir = tempfile::Builder::new().prefix("vmtest-repo-").tempdir()?;
        let target = dir.path().to_string_lossy().into_owned();
        self.run(&["clone", "--depth", "1", "--branch", branch, "--", repo, &target])
            .await?;
        let commit_hash = self.run(&["-C", &target, "rev-parse", "HEAD"]).await?;
        if commit_hash.len() < 40 || !commit_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GitError::InvalidHash(commit_hash));
        }
        debug!(repo, branch, commit = %commit_hash, "cloned tests repository");
        Ok(Checkout { dir, commit_hash })
    }
}
