//! Safety-guarded teardown of a completed polecat.
//!
//! Ordering is load-bearing: every destructive step happens only after the
//! uncommitted-work and push checks pass. An abort leaves everything in
//! place and reports exact counts so the worker can be told what to fix.
//! Nothing else in the crate may delete a worktree or a branch.

use tracing::{info, warn};

use crate::errors::CleanupError;
use crate::git::GitDriver;
use crate::rig::Rig;
use crate::subprocess::CommandRunner;
use crate::tmux::TmuxDriver;

pub struct Cleaner<'a, R: CommandRunner> {
    rig: &'a Rig,
    git: &'a GitDriver<R>,
    tmux: &'a TmuxDriver<R>,
    remote: &'a str,
}

impl<'a, R: CommandRunner> Cleaner<'a, R> {
    pub fn new(
        rig: &'a Rig,
        git: &'a GitDriver<R>,
        tmux: &'a TmuxDriver<R>,
        remote: &'a str,
    ) -> Self {
        Self {
            rig,
            git,
            tmux,
            remote,
        }
    }

    /// Verify a polecat is safe to destroy without touching anything.
    pub fn verify(&self, name: &str) -> Result<(), CleanupError> {
        let worktree = self.rig.polecat_path(name);
        if !worktree.exists() {
            return Ok(());
        }

        let status = self
            .git
            .uncommitted_work(&worktree)
            .map_err(|e| CleanupError::Transport(e.to_string()))?;

        if !status.clean() {
            return Err(CleanupError::UncommittedWork {
                modified: status.modified,
                untracked: status.untracked,
                stashes: status.stash_count,
                unpushed: status.unpushed,
            });
        }

        // A closed issue with an unpushed branch is exactly how work gets
        // lost; check the branch against the remote explicitly. Failures
        // here may just be the network, so they only warn.
        let branch = format!("polecat/{name}");
        match self
            .git
            .branch_pushed_to_remote(&worktree, &branch, self.remote)
        {
            Ok((true, _)) => {}
            Ok((false, unpushed)) => {
                return Err(CleanupError::UncommittedWork {
                    modified: 0,
                    untracked: 0,
                    stashes: 0,
                    unpushed,
                });
            }
            Err(e) => {
                warn!(branch, error = %e, "could not verify branch push state");
            }
        }

        Ok(())
    }

    /// Destroy a polecat's volatile state: session, worktree, branch.
    /// A polecat whose worktree is already gone counts as cleaned.
    pub fn cleanup(&self, name: &str) -> Result<(), CleanupError> {
        let worktree = self.rig.polecat_path(name);
        if !worktree.exists() {
            info!(polecat = name, "worktree already gone, nothing to clean");
            return Ok(());
        }

        self.verify(name)?;

        // From here on the checks have passed; teardown is irreversible.
        let session = self.rig.session_name(name);
        if let Err(e) = self.tmux.kill_session(&session) {
            warn!(session, error = %e, "failed to kill session");
        }

        let clone = self.rig.canonical_clone();
        if let Err(e) = self.git.remove_worktree(&clone, &worktree, true) {
            // The worktree may not be registered (half-finished setup);
            // fall back to removing the directory itself.
            warn!(worktree = %worktree.display(), error = %e, "git worktree remove failed");
            std::fs::remove_dir_all(&worktree)
                .map_err(|e| CleanupError::Transport(e.to_string()))?;
        }

        let branch = format!("polecat/{name}");
        if let Err(e) = self.git.delete_branch(&clone, &branch, true) {
            // Already merged or deleted elsewhere.
            warn!(branch, error = %e, "failed to delete branch");
        }

        info!(polecat = name, "cleanup complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CleanupError;
    use crate::subprocess::CommandResult;
    use crate::subprocess::testing::MockRunner;
    use std::fs;
    use std::sync::Arc;

    struct Fixture {
        _tmp: tempfile::TempDir,
        rig: Rig,
        runner: Arc<MockRunner>,
    }

    fn fixture(with_worktree: bool) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let rig_dir = tmp.path().join("gastown");
        fs::create_dir_all(rig_dir.join("mayor").join("rig")).unwrap();
        if with_worktree {
            fs::create_dir_all(rig_dir.join("polecats").join("Toast")).unwrap();
        }
        let rig = Rig::load(tmp.path(), "gastown").unwrap();
        Fixture {
            _tmp: tmp,
            rig,
            runner: Arc::new(MockRunner::default()),
        }
    }

    fn run_cleanup(fix: &Fixture) -> Result<(), CleanupError> {
        let git = GitDriver::with_runner(Arc::clone(&fix.runner));
        let tmux = TmuxDriver::with_runner(Arc::clone(&fix.runner))
            .with_debounce(std::time::Duration::ZERO);
        Cleaner::new(&fix.rig, &git, &tmux, "origin").cleanup("Toast")
    }

    #[test]
    fn missing_worktree_is_already_cleaned() {
        let fix = fixture(false);
        run_cleanup(&fix).unwrap();
        assert!(fix.runner.calls().is_empty(), "no subprocess should run");
    }

    #[test]
    fn dirty_tree_aborts_before_any_teardown() {
        let fix = fixture(true);
        // status, stash list, rev-list @{upstream}
        fix.runner.push_output(CommandResult::ok(" M src/lib.rs\n?? notes.txt\n"));
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok("0"));

        let err = run_cleanup(&fix).unwrap_err();
        match err {
            CleanupError::UncommittedWork {
                modified,
                untracked,
                ..
            } => {
                assert_eq!(modified, 1);
                assert_eq!(untracked, 1);
            }
            other => panic!("expected UncommittedWork, got {other}"),
        }

        // Nothing destructive ran: no tmux, no worktree remove, no branch
        // delete.
        for call in fix.runner.calls() {
            assert_ne!(call[0], "tmux");
            assert!(!call.contains(&"worktree".to_string()), "{call:?}");
        }
        assert!(fix.rig.polecat_path("Toast").exists());
    }

    #[test]
    fn unpushed_branch_aborts_with_count() {
        let fix = fixture(true);
        // Clean tree...
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok("0"));
        // ...but the branch has 2 commits the remote has not seen.
        fix.runner.push_output(CommandResult::ok("")); // rev-parse --verify remote ref
        fix.runner.push_output(CommandResult::ok("2")); // rev-list remote/branch..branch

        let err = run_cleanup(&fix).unwrap_err();
        assert!(err.to_string().contains("2 unpushed commit(s)"), "{err}");
        assert!(fix.rig.polecat_path("Toast").exists());
    }

    #[test]
    fn clean_polecat_is_torn_down_in_order() {
        let fix = fixture(true);
        // verify: status, stash, upstream count
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok("0"));
        // branch push check: remote ref exists, zero unpushed
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok("0"));
        // tmux: has-session, kill-session
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok(""));
        // git worktree remove
        fix.runner.push_output(CommandResult::ok(""));
        // branch_exists + branch -D
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok(""));

        run_cleanup(&fix).unwrap();

        let calls = fix.runner.calls();
        let kill_idx = calls
            .iter()
            .position(|c| c[0] == "tmux" && c[1] == "kill-session")
            .expect("session killed");
        let worktree_idx = calls
            .iter()
            .position(|c| c[0] == "git" && c[1] == "worktree")
            .expect("worktree removed");
        let branch_idx = calls
            .iter()
            .position(|c| c[0] == "git" && c[1] == "branch")
            .expect("branch deleted");
        assert!(kill_idx < worktree_idx && worktree_idx < branch_idx);

        let worktree_call = &calls[worktree_idx];
        assert!(worktree_call.contains(&"--force".to_string()));
    }

    #[test]
    fn branch_delete_failure_is_not_fatal() {
        let fix = fixture(true);
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok("0"));
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok("0"));
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok(""));
        fix.runner.push_output(CommandResult::ok(""));
        // branch_exists probe errors out
        fix.runner.push_output(CommandResult::fail("fatal: bad repo"));

        run_cleanup(&fix).unwrap();
    }

    #[test]
    fn status_probe_failure_is_transport() {
        let fix = fixture(true);
        fix.runner
            .push_output(CommandResult::fail("fatal: not a git repository"));

        let err = run_cleanup(&fix).unwrap_err();
        assert!(matches!(err, CleanupError::Transport(_)));
        assert!(fix.rig.polecat_path("Toast").exists());
    }
}
