//! Git CLI wrapper
//!
//! All repository manipulation shells out to the `git` binary through
//! `tokio::process` with a per-command timeout. Worktree slots share one
//! object store via git's native worktree mechanism.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{NecroError, Result};

const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// A git handle bound to one working directory
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Run a git subcommand, returning trimmed stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let label = args.join(" ");
        debug!(workdir = %self.workdir.display(), "git {label}");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("git")
                .args(args)
                .current_dir(&self.workdir)
                .env("GIT_TERMINAL_PROMPT", "0")
                .output(),
        )
        .await
        .map_err(|_| NecroError::GitTimeout {
            command: label.clone(),
            timeout_secs: self.timeout.as_secs(),
        })??;

        if !output.status.success() {
            return Err(NecroError::GitCommand {
                command: label,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Clone `repo_url` into `dest`. The parent of `dest` must exist.
    pub async fn clone_repo(repo_url: &str, dest: &Path, timeout: Duration) -> Result<Git> {
        let parent = dest.parent().unwrap_or(Path::new("."));
        let git = Git::new(parent).with_timeout(timeout);
        let dest_str = dest.to_string_lossy().to_string();
        git.run(&["clone", repo_url, &dest_str])
            .await
            .map_err(|e| NecroError::CloneFailed {
                repo_url: repo_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Git::new(dest).with_timeout(timeout))
    }

    // ═══════════════════════════════════════════════════════════════
    // Worktrees
    // ═══════════════════════════════════════════════════════════════

    /// Create a worktree at `path` on a new `branch` rooted at HEAD.
    pub async fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        self.run(&["worktree", "add", "-b", branch, &path_str])
            .await?;
        Ok(())
    }

    /// Remove a worktree, discarding its state.
    pub async fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        self.run(&["worktree", "remove", "--force", &path_str])
            .await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Branch and state queries
    // ═══════════════════════════════════════════════════════════════

    pub async fn current_branch(&self) -> Result<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    pub async fn head_commit(&self) -> Result<String> {
        self.run(&["rev-parse", "HEAD"]).await
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        match self
            .run(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .await
        {
            Ok(_) => Ok(true),
            Err(NecroError::GitCommand { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.run(&["checkout", branch]).await?;
        Ok(())
    }

    pub async fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        self.run(&["checkout", "-b", branch]).await?;
        Ok(())
    }

    /// Discard all tracked changes.
    pub async fn reset_hard(&self) -> Result<()> {
        self.run(&["reset", "--hard"]).await?;
        Ok(())
    }

    /// Remove untracked files and directories, including ignored ones.
    pub async fn clean_fdx(&self) -> Result<()> {
        self.run(&["clean", "-fdx"]).await?;
        Ok(())
    }

    /// Refresh the shared object store.
    pub async fn fetch_origin(&self) -> Result<()> {
        self.run(&["fetch", "origin"]).await?;
        Ok(())
    }

    /// True when the working tree has no pending changes.
    pub async fn is_clean(&self) -> Result<bool> {
        Ok(self.run(&["status", "--porcelain"]).await?.is_empty())
    }

    // ═══════════════════════════════════════════════════════════════
    // Commit and push
    // ═══════════════════════════════════════════════════════════════

    pub async fn add_all(&self) -> Result<()> {
        self.run(&["add", "--all"]).await?;
        Ok(())
    }

    pub async fn commit(&self, message: &str) -> Result<String> {
        self.run(&["commit", "-m", message]).await?;
        self.head_commit().await
    }

    pub async fn push(&self, branch: &str) -> Result<()> {
        self.run(&["push", "origin", &format!("{branch}:{branch}")])
            .await?;
        Ok(())
    }

    /// Unified diff of one commit against its parent.
    pub async fn diff_of_commit(&self, commit: &str) -> Result<String> {
        self.run(&["show", "--format=", commit]).await
    }
}
