//! Typed errors at the seams the supervisor dispatches on.
//!
//! Plumbing code propagates `anyhow::Error` with context; these enums exist
//! where a caller branches on the *kind* of failure: the issue-store gateway,
//! the mailbox, the safety-guarded cleaner, and witness lifecycle.

use thiserror::Error;

/// Issue-store gateway failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("store transport error: {0}")]
    Transport(String),

    #[error("store constraint violation: {0}")]
    Constraint(String),
}

impl StoreError {
    /// Classify raw `bd` stderr. The CLI phrases missing items several ways.
    pub fn from_stderr(stderr: &str) -> Self {
        let msg = stderr.trim();
        let lower = msg.to_lowercase();
        if lower.contains("not found") || lower.contains("no issue") || lower.contains("no issues")
        {
            StoreError::NotFound
        } else if lower.contains("already exists") || lower.contains("constraint") {
            StoreError::Constraint(msg.to_string())
        } else {
            StoreError::Transport(msg.to_string())
        }
    }
}

/// Mailbox and router failures.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("message not found")]
    MessageNotFound,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("{caller} is not eligible to claim from queue {queue}")]
    NotEligible { caller: String, queue: String },

    #[error("message was not claimed by the caller")]
    NotClaimedByCaller,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Safety-guarded cleaner failures. `UncommittedWork` is the abort the
/// dispatcher converts into a NUDGE; everything else is retried blindly.
#[derive(Debug)]
pub enum CleanupError {
    UncommittedWork {
        modified: usize,
        untracked: usize,
        stashes: usize,
        unpushed: usize,
    },

    Transport(String),
}

impl std::fmt::Display for CleanupError {
    /// The uncommitted-work message enumerates only the non-zero counts;
    /// that text ends up in the NUDGE sent to the worker.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupError::UncommittedWork {
                modified,
                untracked,
                stashes,
                unpushed,
            } => {
                let mut parts = Vec::new();
                if *modified > 0 {
                    parts.push(format!("{modified} modified file(s)"));
                }
                if *untracked > 0 {
                    parts.push(format!("{untracked} untracked file(s)"));
                }
                if *stashes > 0 {
                    parts.push(format!("{stashes} stash(es)"));
                }
                if *unpushed > 0 {
                    parts.push(format!("{unpushed} unpushed commit(s)"));
                }
                write!(f, "uncommitted work: {}", parts.join(", "))
            }
            CleanupError::Transport(detail) => write!(f, "cleanup transport error: {detail}"),
        }
    }
}

impl std::error::Error for CleanupError {}

/// Witness lifecycle errors, returned from Start/Stop only.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WitnessError {
    #[error("witness already running")]
    AlreadyRunning,

    #[error("witness not running")]
    NotRunning,
}
