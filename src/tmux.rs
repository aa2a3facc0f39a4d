//! tmux session driver.
//!
//! Wraps the tmux CLI for session lifecycle, keystroke injection, pane
//! probing, and per-session environment. Keystroke injection always sends
//! text in literal mode, waits out a paste debounce, then sends Enter as a
//! separate command — Enter arriving before the paste is processed is the
//! classic way injected prompts get swallowed.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, info};

use crate::subprocess::{CommandRunner, ShellCommandRunner};

/// Debounce used when nudging an interactive agent session.
pub const NUDGE_DEBOUNCE_MS: u64 = 500;

/// Shells we expect at an idle pane; anything else is a live agent.
const SHELLS: &[&str] = &["bash", "zsh", "sh", "fish", "tcsh", "ksh"];

pub struct TmuxDriver<R: CommandRunner = ShellCommandRunner> {
    runner: R,
    /// Debounce applied between paste and Enter. Tests set this to zero.
    debounce: Duration,
}

impl TmuxDriver<ShellCommandRunner> {
    pub fn new() -> Self {
        Self::with_runner(ShellCommandRunner)
    }
}

impl Default for TmuxDriver<ShellCommandRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> TmuxDriver<R> {
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            debounce: Duration::from_millis(NUDGE_DEBOUNCE_MS),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let result = self.runner.run("tmux", &args, Path::new("."), &[])?;
        if !result.status_success {
            bail!("tmux {}: {}", args[0], result.stderr.trim());
        }
        Ok(result.stdout.trim().to_string())
    }

    /// True when stderr indicates the session (or the whole server) is gone.
    fn session_absent(stderr: &str) -> bool {
        stderr.contains("no server running")
            || stderr.contains("error connecting to")
            || stderr.contains("can't find session")
            || stderr.contains("session not found")
    }

    pub fn has_session(&self, session: &str) -> Result<bool> {
        let args: Vec<String> = ["has-session", "-t", session]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = self.runner.run("tmux", &args, Path::new("."), &[])?;
        if result.status_success {
            return Ok(true);
        }
        if Self::session_absent(&result.stderr) || result.stderr.trim().is_empty() {
            return Ok(false);
        }
        bail!("tmux has-session: {}", result.stderr.trim());
    }

    pub fn new_session(&self, session: &str, work_dir: &Path) -> Result<()> {
        let dir = work_dir.to_string_lossy();
        self.run(&["new-session", "-d", "-s", session, "-c", dir.as_ref()])?;
        info!(session, "tmux session created");
        Ok(())
    }

    /// Kill a session. Killing a session that does not exist succeeds.
    pub fn kill_session(&self, session: &str) -> Result<()> {
        if !self.has_session(session)? {
            return Ok(());
        }
        self.run(&["kill-session", "-t", session])?;
        info!(session, "tmux session killed");
        Ok(())
    }

    /// Send a line of text: literal paste, debounce, separate Enter.
    pub fn send_keys(&self, session: &str, keys: &str) -> Result<()> {
        self.run(&["send-keys", "-t", session, "-l", keys])?;
        if !self.debounce.is_zero() {
            std::thread::sleep(self.debounce);
        }
        self.run(&["send-keys", "-t", session, "Enter"])?;
        debug!(session, "sent keys");
        Ok(())
    }

    /// Canonical way to deliver a message into an interactive agent pane.
    #[allow(dead_code)]
    pub fn nudge_session(&self, session: &str, message: &str) -> Result<()> {
        self.send_keys(session, message)
    }

    #[allow(dead_code)]
    pub fn capture_pane(&self, session: &str, lines: u32) -> Result<String> {
        self.run(&[
            "capture-pane",
            "-p",
            "-t",
            session,
            "-S",
            &format!("-{lines}"),
        ])
    }

    /// The command currently running in the session's pane.
    pub fn pane_current_command(&self, session: &str) -> Result<String> {
        self.run(&["list-panes", "-t", session, "-F", "#{pane_current_command}"])
    }

    /// True when the pane is running something other than a bare shell.
    /// Interactive coding agents show up as their runtime (e.g. `node`).
    pub fn agent_alive(&self, session: &str) -> bool {
        match self.pane_current_command(session) {
            Ok(cmd) => {
                let cmd = cmd.trim();
                !cmd.is_empty() && !SHELLS.contains(&cmd)
            }
            Err(_) => false,
        }
    }

    pub fn set_environment(&self, session: &str, key: &str, value: &str) -> Result<()> {
        self.run(&["set-environment", "-t", session, key, value])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::CommandResult;
    use crate::subprocess::testing::MockRunner;

    fn driver(runner: MockRunner) -> TmuxDriver<MockRunner> {
        TmuxDriver::with_runner(runner).with_debounce(Duration::ZERO)
    }

    #[test]
    fn has_session_true_on_success() {
        let tmux = driver(MockRunner::with_outputs(vec![CommandResult::ok("")]));
        assert!(tmux.has_session("gt-gastown-Toast").unwrap());
    }

    #[test]
    fn missing_session_is_false_not_error() {
        for stderr in [
            "can't find session: gt-gastown-Toast",
            "no server running on /tmp/tmux-1000/default",
        ] {
            let tmux = driver(MockRunner::with_outputs(vec![CommandResult::fail(stderr)]));
            assert!(!tmux.has_session("gt-gastown-Toast").unwrap());
        }
    }

    #[test]
    fn kill_session_skips_when_absent() {
        let tmux = driver(MockRunner::with_outputs(vec![CommandResult::fail(
            "can't find session: gone",
        )]));
        tmux.kill_session("gone").unwrap();
        // Only the has-session probe ran.
        assert_eq!(tmux.runner.calls().len(), 1);
    }

    #[test]
    fn kill_session_kills_when_present() {
        let tmux = driver(MockRunner::with_outputs(vec![
            CommandResult::ok(""),
            CommandResult::ok(""),
        ]));
        tmux.kill_session("gt-gastown-Toast").unwrap();
        let calls = tmux.runner.calls();
        assert_eq!(calls[1][1], "kill-session");
        assert_eq!(calls[1][3], "gt-gastown-Toast");
    }

    #[test]
    fn send_keys_is_literal_then_enter() {
        let tmux = driver(MockRunner::with_outputs(vec![
            CommandResult::ok(""),
            CommandResult::ok(""),
        ]));
        tmux.send_keys("gt-gastown-Toast", "NUDGE: still working?").unwrap();

        let calls = tmux.runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            vec![
                "tmux",
                "send-keys",
                "-t",
                "gt-gastown-Toast",
                "-l",
                "NUDGE: still working?"
            ]
        );
        assert_eq!(
            calls[1],
            vec!["tmux", "send-keys", "-t", "gt-gastown-Toast", "Enter"]
        );
    }

    #[test]
    fn agent_alive_distinguishes_shells() {
        let tmux = driver(MockRunner::with_outputs(vec![CommandResult::ok("node")]));
        assert!(tmux.agent_alive("s"));

        let tmux = driver(MockRunner::with_outputs(vec![CommandResult::ok("bash")]));
        assert!(!tmux.agent_alive("s"));

        let tmux = driver(MockRunner::with_outputs(vec![CommandResult::fail(
            "can't find session: s",
        )]));
        assert!(!tmux.agent_alive("s"));
    }

    #[test]
    fn set_environment_passes_key_value() {
        let tmux = driver(MockRunner::with_outputs(vec![CommandResult::ok("")]));
        tmux.set_environment("gt-gastown-witness", "GT_ROLE", "witness")
            .unwrap();
        let calls = tmux.runner.calls();
        assert_eq!(
            calls[0],
            vec![
                "tmux",
                "set-environment",
                "-t",
                "gt-gastown-witness",
                "GT_ROLE",
                "witness"
            ]
        );
    }
}
