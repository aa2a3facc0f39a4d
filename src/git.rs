//! Version-control driver.
//!
//! Exposes exactly what the supervisor needs: working-tree cleanliness with
//! counts, stash count, push state of a branch against the configured
//! remote, worktree removal, and branch deletion. The uncommitted-work
//! probe is what stands between the cleaner and lost work, so its counts
//! are exact, not boolean.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::warn;

use crate::subprocess::{CommandRunner, ShellCommandRunner};

/// Counts from the uncommitted-work probe. All four must be zero before a
/// worktree may be destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UncommittedStatus {
    pub modified: usize,
    pub untracked: usize,
    pub stash_count: usize,
    pub unpushed: usize,
}

impl UncommittedStatus {
    pub fn clean(&self) -> bool {
        self.modified == 0 && self.untracked == 0 && self.stash_count == 0 && self.unpushed == 0
    }
}

pub struct GitDriver<R: CommandRunner = ShellCommandRunner> {
    runner: R,
}

impl GitDriver<ShellCommandRunner> {
    pub fn new() -> Self {
        Self::with_runner(ShellCommandRunner)
    }
}

impl Default for GitDriver<ShellCommandRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> GitDriver<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    fn run_git(&self, repo: &Path, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let result = self.runner.run("git", &args, repo, &[])?;
        if !result.status_success {
            bail!("git {}: {}", args[0], result.stderr.trim());
        }
        Ok(result.stdout)
    }

    /// Exit-code-sensitive variant for probes where 1 means "no".
    fn run_git_check(&self, repo: &Path, args: &[&str]) -> Result<bool> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let result = self.runner.run("git", &args, repo, &[])?;
        Ok(result.status_success)
    }

    /// Probe a worktree for anything cleanup would destroy.
    pub fn uncommitted_work(&self, worktree: &Path) -> Result<UncommittedStatus> {
        let status = self.run_git(worktree, &["status", "--porcelain"])?;
        let mut modified = 0;
        let mut untracked = 0;
        for line in status.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if line.starts_with("??") {
                untracked += 1;
            } else {
                modified += 1;
            }
        }

        let stash = self.run_git(worktree, &["stash", "list"])?;
        let stash_count = stash.lines().filter(|l| !l.trim().is_empty()).count();

        // No upstream configured counts as zero; the branch push check in
        // the cleaner covers that case against the explicit remote.
        let unpushed = match self.run_git(worktree, &["rev-list", "--count", "@{upstream}..HEAD"]) {
            Ok(out) => out.trim().parse::<usize>().unwrap_or(0),
            Err(e) => {
                warn!(worktree = %worktree.display(), error = %e, "no upstream for unpushed count");
                0
            }
        };

        Ok(UncommittedStatus {
            modified,
            untracked,
            stash_count,
            unpushed,
        })
    }

    /// Whether `branch` is fully contained in `remote/branch`.
    ///
    /// Returns `(pushed, unpushed_count)`. A missing remote-tracking ref
    /// means nothing was pushed; the whole branch counts as unpushed.
    pub fn branch_pushed_to_remote(
        &self,
        repo: &Path,
        branch: &str,
        remote: &str,
    ) -> Result<(bool, usize)> {
        let remote_ref = format!("refs/remotes/{remote}/{branch}");
        let has_remote_ref =
            self.run_git_check(repo, &["rev-parse", "--verify", "--quiet", &remote_ref])?;

        let count = if has_remote_ref {
            let range = format!("{remote}/{branch}..{branch}");
            self.run_git(repo, &["rev-list", "--count", &range])?
                .trim()
                .parse::<usize>()
                .unwrap_or(0)
        } else {
            self.run_git(repo, &["rev-list", "--count", branch])?
                .trim()
                .parse::<usize>()
                .unwrap_or(0)
        };

        Ok((count == 0, count))
    }

    pub fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let ref_name = format!("refs/heads/{branch}");
        self.run_git_check(repo, &["show-ref", "--verify", "--quiet", &ref_name])
    }

    /// Remove a worktree registered in `repo`. A missing path succeeds.
    pub fn remove_worktree(&self, repo: &Path, path: &Path, force: bool) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let path_s = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_s.as_str());
        self.run_git(repo, &args)?;
        Ok(())
    }

    /// Delete a local branch. A missing branch succeeds.
    pub fn delete_branch(&self, repo: &Path, branch: &str, force: bool) -> Result<()> {
        if !self.branch_exists(repo, branch)? {
            return Ok(());
        }
        let flag = if force { "-D" } else { "-d" };
        self.run_git(repo, &[
            "branch", flag, branch,
        ])?;
        Ok(())
    }
}
