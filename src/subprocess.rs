//! Subprocess seam shared by every external driver.
//!
//! All side effects in Gas Town flow through child processes (`bd`, `git`,
//! `tmux`, `gt spawn`). The `CommandRunner` trait is the single choke point:
//! production code uses `ShellCommandRunner`, tests substitute a mock that
//! replays canned outputs and records the argv it saw.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};

/// Captured result of one child process invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status_success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    #[allow(dead_code)]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status_success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[allow(dead_code)]
    pub fn fail(stderr: impl Into<String>) -> Self {
        Self {
            status_success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

pub trait CommandRunner: Send + Sync + 'static {
    /// Run `program` with `args` in `cwd`, with extra environment entries
    /// appended to the inherited environment.
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
    ) -> Result<CommandResult>;
}

/// Shares a runner between drivers without forcing callers to pick one
/// generic parameter for the whole process tree.
impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
    ) -> Result<CommandResult> {
        (**self).run(program, args, cwd, env)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env: &[(String, String)],
    ) -> Result<CommandResult> {
        let mut cmd = Command::new(program);
        cmd.current_dir(cwd).args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .with_context(|| format!("failed to run '{}' in {}", program, cwd.display()))?;

        Ok(CommandResult {
            status_success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_runner_captures_stdout() {
        let runner = ShellCommandRunner;
        let result = runner
            .run("echo", &["hello".to_string()], Path::new("/tmp"), &[])
            .unwrap();
        assert!(result.status_success);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn shell_runner_reports_failure_status() {
        let runner = ShellCommandRunner;
        let result = runner
            .run("false", &[], Path::new("/tmp"), &[])
            .unwrap();
        assert!(!result.status_success);
    }

    #[test]
    fn shell_runner_passes_environment() {
        let runner = ShellCommandRunner;
        let result = runner
            .run(
                "sh",
                &["-c".to_string(), "echo $GT_TEST_VALUE".to_string()],
                Path::new("/tmp"),
                &[("GT_TEST_VALUE".to_string(), "rig-7".to_string())],
            )
            .unwrap();
        assert_eq!(result.stdout.trim(), "rig-7");
    }

    #[test]
    fn arc_runner_delegates() {
        let runner = std::sync::Arc::new(ShellCommandRunner);
        let result = runner
            .run("echo", &["via-arc".to_string()], Path::new("/tmp"), &[])
            .unwrap();
        assert_eq!(result.stdout.trim(), "via-arc");
    }
}
