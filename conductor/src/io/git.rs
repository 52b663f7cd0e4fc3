//! Git adapter for worktree lanes.
//!
//! The coordinator only needs a handful of git operations, so we keep a small,
//! explicit wrapper around `git` subprocess calls. Lock contention between
//! lanes sharing one repository is retried with bounded exponential backoff;
//! anything else fails on the first attempt.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

const GIT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Stderr fragments git prints when another process holds a lock.
const TRANSIENT_MARKERS: &[&str] = &[
    "index.lock",
    "could not lock",
    "cannot lock ref",
    "unable to create",
    "another git process seems to be running",
    "resource temporarily unavailable",
];

/// A git invocation that ran and failed.
#[derive(Debug, Error)]
#[error("git {args} {}: {stderr}", if *.timed_out { "timed out" } else { "failed" })]
pub struct GitCommandError {
    pub args: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl GitCommandError {
    /// Lock contention and timeouts may clear up on their own.
    pub fn is_transient(&self) -> bool {
        if self.timed_out {
            return true;
        }
        let stderr = self.stderr.to_ascii_lowercase();
        TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m))
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<GitCommandError>()
        .is_some_and(GitCommandError::is_transient)
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name, `None` for detached worktrees.
    pub branch: Option<String>,
}

/// Wrapper for executing git commands in a repository.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        self.succeeds(&["show-ref", "--verify", "--quiet", &reference])
    }

    /// Check whether `rev` names a commit.
    pub fn rev_exists(&self, rev: &str) -> Result<bool> {
        let spec = format!("{rev}^{{commit}}");
        self.succeeds(&["rev-parse", "--verify", "--quiet", &spec])
    }

    /// `git worktree add -b <branch> <path> <base>`.
    ///
    /// A missing base is a definitive failure and is reported without retrying.
    #[instrument(skip_all, fields(branch = %branch, base = %base))]
    pub fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        if !self.rev_exists(base)? {
            return Err(anyhow!("base branch '{base}' does not exist"));
        }
        let path_arg = path.to_string_lossy();
        self.run_retrying(&["worktree", "add", "-b", branch, &path_arg, base])?;
        debug!(path = %path.display(), "worktree added");
        Ok(())
    }

    /// `git worktree add <path> <branch>` for a branch that already exists.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn worktree_attach(&self, path: &Path, branch: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_retrying(&["worktree", "add", &path_arg, branch])?;
        debug!(path = %path.display(), "worktree attached to existing branch");
        Ok(())
    }

    /// `git worktree remove --force <path>`, then prune stale metadata.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_retrying(&["worktree", "remove", "--force", &path_arg])?;
        self.run_retrying(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run_retrying(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_checked(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    /// Delete a branch only if it is merged (`git branch -d`).
    ///
    /// Returns `Ok(false)` when git refuses because the branch has unmerged work.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn delete_branch_if_merged(&self, branch: &str) -> Result<bool> {
        match self.run_retrying(&["branch", "-d", branch]) {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .downcast_ref::<GitCommandError>()
                    .is_some_and(|e| e.stderr.contains("not fully merged")) =>
            {
                warn!(branch, "branch has unmerged work, keeping it");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn run_retrying(&self, args: &[&str]) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.run_checked(args) {
                Ok(out) => return Ok(out),
                Err(err) if attempt < self.retry.max_retries && is_transient(&err) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        err = %err,
                        "transient git failure, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn succeeds(&self, args: &[&str]) -> Result<bool> {
        let output = self.spawn(args)?;
        Ok(output.success())
    }

    fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.spawn(args)?;
        if !output.success() {
            return Err(GitCommandError {
                args: args.join(" "),
                stderr: output.stderr_text(),
                timed_out: output.timed_out,
            }
            .into());
        }
        Ok(output.stdout_text())
    }

    fn spawn(&self, args: &[&str]) -> Result<crate::io::process::CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, None, self.timeout, GIT_OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(reference) = line.strip_prefix("branch ")
            && let Some(entry) = current.as_mut()
        {
            let short = reference.strip_prefix("refs/heads/").unwrap_or(reference);
            entry.branch = Some(short.to_string());
        }
    }
    entries.extend(current);
    entries
}
