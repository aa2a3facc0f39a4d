//! Issue-store gateway: the narrow surface the supervisor needs from `bd`.
//!
//! Every operation shells out to the `bd` CLI in JSON mode through the
//! `CommandRunner` seam. Failures are classified into `StoreError` kinds so
//! callers can branch on missing items versus transport trouble; the raw
//! CLI phrases several "not found" variants, all normalized here.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::StoreError;
use crate::subprocess::{CommandRunner, ShellCommandRunner};

/// An issue as returned by `bd list` / `bd show --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub wisp: bool,
    #[serde(default, rename = "issue_type")]
    pub issue_type: String,
    #[serde(default)]
    pub dependents: Vec<Dependent>,
    /// Set on append-only event records.
    #[serde(default)]
    pub event_kind: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

/// A dependency edge from `bd show`.
#[derive(Debug, Clone, Deserialize)]
pub struct Dependent {
    pub id: String,
    #[serde(default)]
    pub dependency_type: String,
}

/// An item from the store's `ready` view (no open blockers).
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyIssue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "issue_type")]
    pub issue_type: String,
    #[serde(default)]
    pub status: String,
}

/// AND-composed list filters.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub issue_type: Option<String>,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub sort: Option<String>,
    pub wisp_only: bool,
    pub event_kind: Option<String>,
}

/// Fields for `create`. `ephemeral` marks the item as a wisp: stored
/// locally, never exported to the shared distribution layer.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub id: Option<String>,
    pub issue_type: Option<String>,
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub priority: Option<i64>,
    pub assignee: Option<String>,
    pub ephemeral: bool,
    pub event_kind: Option<String>,
    pub payload: Option<String>,
}

/// Partial update; unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdatePatch {
    pub labels: Option<Vec<String>>,
    pub assignee: Option<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub pinned: Option<bool>,
}

pub struct BeadsClient<R: CommandRunner = ShellCommandRunner> {
    work_dir: PathBuf,
    beads_dir: Option<PathBuf>,
    runner: R,
}

impl BeadsClient<ShellCommandRunner> {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self::with_runner(work_dir, ShellCommandRunner)
    }
}

impl<R: CommandRunner> BeadsClient<R> {
    pub fn with_runner(work_dir: impl Into<PathBuf>, runner: R) -> Self {
        Self {
            work_dir: work_dir.into(),
            beads_dir: None,
            runner,
        }
    }

    /// Point `bd` at an explicit store directory via `BEADS_DIR`.
    pub fn with_beads_dir(mut self, beads_dir: impl Into<PathBuf>) -> Self {
        self.beads_dir = Some(beads_dir.into());
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn run_bd(&self, args: &[String]) -> Result<String, StoreError> {
        let env: Vec<(String, String)> = match &self.beads_dir {
            Some(dir) => vec![("BEADS_DIR".to_string(), dir.to_string_lossy().to_string())],
            None => Vec::new(),
        };

        let result = self
            .runner
            .run("bd", args, &self.work_dir, &env)
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !result.status_success {
            return Err(StoreError::from_stderr(&result.stderr));
        }
        Ok(result.stdout)
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Issue>, StoreError> {
        let mut args = vec!["list".to_string()];
        if let Some(t) = &filter.issue_type {
            args.push("--type".to_string());
            args.push(t.clone());
        }
        if let Some(a) = &filter.assignee {
            args.push("--assignee".to_string());
            args.push(a.clone());
        }
        if !filter.labels.is_empty() {
            args.push("--labels".to_string());
            args.push(filter.labels.join(","));
        }
        if let Some(s) = &filter.status {
            args.push("--status".to_string());
            args.push(s.clone());
        }
        if let Some(limit) = filter.limit {
            args.push("--limit".to_string());
            args.push(limit.to_string());
        }
        if let Some(sort) = &filter.sort {
            args.push("--sort".to_string());
            args.push(sort.clone());
        }
        if filter.wisp_only {
            args.push("--wisp".to_string());
        }
        if let Some(kind) = &filter.event_kind {
            args.push("--event-kind".to_string());
            args.push(kind.clone());
        }
        args.push("--json".to_string());

        let stdout = match self.list_raw(&args) {
            Ok(out) => out,
            // An empty result set is not an error.
            Err(StoreError::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        parse_issue_array(&stdout)
    }

    fn list_raw(&self, args: &[String]) -> Result<String, StoreError> {
        self.run_bd(args)
    }

    /// Batched show. Missing ids surface as `NotFound`.
    pub fn show(&self, ids: &[&str]) -> Result<Vec<Issue>, StoreError> {
        let mut args = vec!["show".to_string()];
        args.extend(ids.iter().map(|s| s.to_string()));
        args.push("--json".to_string());

        let stdout = self.run_bd(&args)?;
        let issues = parse_issue_array(&stdout)?;
        if issues.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(issues)
    }

    /// Check an id exists without fetching details.
    pub fn exists(&self, id: &str) -> Result<bool, StoreError> {
        match self.show(&[id]) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create an issue and return its id, parsed from the CLI output.
    pub fn create(&self, spec: &CreateSpec) -> Result<String, StoreError> {
        let mut args = vec!["create".to_string()];
        if let Some(id) = &spec.id {
            args.push("--id".to_string());
            args.push(id.clone());
        }
        if let Some(t) = &spec.issue_type {
            args.push("--type".to_string());
            args.push(t.clone());
        }
        args.push("--title".to_string());
        args.push(spec.title.clone());
        if !spec.description.is_empty() {
            args.push("--description".to_string());
            args.push(spec.description.clone());
        }
        if !spec.labels.is_empty() {
            args.push("--labels".to_string());
            args.push(spec.labels.join(","));
        }
        if let Some(priority) = spec.priority {
            args.push("--priority".to_string());
            args.push(priority.to_string());
        }
        if let Some(assignee) = &spec.assignee {
            args.push("--assignee".to_string());
            args.push(assignee.clone());
        }
        if spec.ephemeral {
            args.push("--wisp".to_string());
        }
        if let Some(kind) = &spec.event_kind {
            args.push("--event-kind".to_string());
            args.push(kind.clone());
        }
        if let Some(payload) = &spec.payload {
            args.push("--payload".to_string());
            args.push(payload.clone());
        }

        let stdout = self.run_bd(&args)?;
        parse_created_id(&stdout).ok_or_else(|| {
            StoreError::Transport(format!("could not parse created id from: {}", stdout.trim()))
        })
    }

    pub fn update(&self, id: &str, patch: &UpdatePatch) -> Result<(), StoreError> {
        let mut args = vec!["update".to_string(), id.to_string()];
        if let Some(labels) = &patch.labels {
            args.push("--labels".to_string());
            args.push(labels.join(","));
        }
        if let Some(assignee) = &patch.assignee {
            args.push("--assignee".to_string());
            args.push(assignee.clone());
        }
        if let Some(status) = &patch.status {
            args.push("--status".to_string());
            args.push(status.clone());
        }
        if let Some(description) = &patch.description {
            args.push("--description".to_string());
            args.push(description.clone());
        }
        if patch.pinned == Some(true) {
            args.push("--pinned".to_string());
        }

        self.run_bd(&args)?;
        Ok(())
    }

    /// Close an issue. Closing an already-closed issue succeeds.
    pub fn close(&self, id: &str, reason: Option<&str>) -> Result<(), StoreError> {
        let mut args = vec!["close".to_string(), id.to_string()];
        if let Some(reason) = reason {
            args.push("--reason".to_string());
            args.push(reason.to_string());
        }

        match self.run_bd(&args) {
            Ok(_) => Ok(()),
            Err(StoreError::Constraint(msg)) if msg.to_lowercase().contains("closed") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Batch-delete ephemeral items. The store rejects non-wisp ids.
    #[allow(dead_code)]
    pub fn burn(&self, ids: &[&str]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["burn".to_string()];
        args.extend(ids.iter().map(|s| s.to_string()));
        self.run_bd(&args)?;
        Ok(())
    }

    /// All messages in a thread, via the store's dedicated thread view.
    pub fn message_thread(&self, thread_id: &str) -> Result<Vec<Issue>, StoreError> {
        let args = vec![
            "message".to_string(),
            "thread".to_string(),
            thread_id.to_string(),
            "--json".to_string(),
        ];
        match self.run_bd(&args) {
            Ok(stdout) => parse_issue_array(&stdout),
            Err(StoreError::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// The store's ready view: open items with no open blockers.
    pub fn ready(&self) -> Result<Vec<ReadyIssue>, StoreError> {
        let args = vec!["ready".to_string(), "--json".to_string()];
        let stdout = self.run_bd(&args)?;
        let trimmed = stdout.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed).map_err(|e| StoreError::Transport(e.to_string()))
    }
}

fn parse_issue_array(stdout: &str) -> Result<Vec<Issue>, StoreError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" || trimmed == "[]" {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| StoreError::Transport(e.to_string()))
}

/// Extract the new id from `bd create` output. The CLI has printed both
/// `Created: <id>` and `✓ Created issue: <id>` across versions.
fn parse_created_id(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(idx) = line.find("Created") {
            let rest = &line[idx..];
            if let Some(colon) = rest.find(':') {
                let id = rest[colon + 1..].trim();
                if !id.is_empty() {
                    return Some(id.split_whitespace().next().unwrap_or(id).to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::CommandResult;
    use crate::subprocess::testing::MockRunner;

    fn client(runner: MockRunner) -> BeadsClient<MockRunner> {
        BeadsClient::with_runner("/tmp", runner)
    }

    #[test]
    fn list_composes_filters() {
        let runner = MockRunner::with_outputs(vec![CommandResult::ok("[]")]);
        let bd = client(runner);
        let filter = ListFilter {
            issue_type: Some("message".to_string()),
            assignee: Some("gastown/witness".to_string()),
            status: Some("open".to_string()),
            sort: Some("created".to_string()),
            limit: Some(0),
            ..Default::default()
        };
        let issues = bd.list(&filter).unwrap();
        assert!(issues.is_empty());

        let calls = bd.runner.calls();
        let argv = &calls[0];
        assert_eq!(argv[0], "bd");
        assert_eq!(argv[1], "list");
        for expected in [
            "--type",
            "message",
            "--assignee",
            "gastown/witness",
            "--status",
            "open",
            "--limit",
            "0",
            "--sort",
            "created",
            "--json",
        ] {
            assert!(argv.contains(&expected.to_string()), "missing {expected} in {argv:?}");
        }
    }

    #[test]
    fn list_parses_issues() {
        let runner = MockRunner::with_outputs(vec![CommandResult::ok(
            r#"[{"id":"hq-1","title":"POLECAT_DONE Toast","status":"open",
                "assignee":"gastown/witness","priority":2,
                "labels":["from:gastown/Toast"],"wisp":true}]"#,
        )]);
        let bd = client(runner);
        let issues = bd.list(&ListFilter::default()).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, "hq-1");
        assert!(issues[0].wisp);
        assert_eq!(issues[0].labels, vec!["from:gastown/Toast"]);
    }

    #[test]
    fn show_not_found_normalized() {
        let runner =
            MockRunner::with_outputs(vec![CommandResult::fail("error: issue hq-x not found")]);
        let bd = client(runner);
        assert!(matches!(bd.show(&["hq-x"]), Err(StoreError::NotFound)));
    }

    #[test]
    fn show_empty_array_is_not_found() {
        let runner = MockRunner::with_outputs(vec![CommandResult::ok("[]")]);
        let bd = client(runner);
        assert!(matches!(bd.show(&["hq-x"]), Err(StoreError::NotFound)));
    }

    #[test]
    fn create_parses_both_id_formats() {
        assert_eq!(
            parse_created_id("Created: hq-abc123").as_deref(),
            Some("hq-abc123")
        );
        assert_eq!(
            parse_created_id("✓ Created issue: gt-xyz").as_deref(),
            Some("gt-xyz")
        );
        assert_eq!(parse_created_id("nothing"), None);
    }

    #[test]
    fn create_sends_wisp_flag_for_ephemeral() {
        let runner = MockRunner::with_outputs(vec![CommandResult::ok("Created: hq-1")]);
        let bd = client(runner);
        let id = bd
            .create(&CreateSpec {
                title: "swarm:swarm-7".to_string(),
                description: "Tracking batch".to_string(),
                labels: vec!["swarm:swarm-7".to_string(), "total:10".to_string()],
                ephemeral: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(id, "hq-1");

        let argv = &bd.runner.calls()[0];
        assert!(argv.contains(&"--wisp".to_string()));
        assert!(argv.contains(&"swarm:swarm-7,total:10".to_string()));
    }

    #[test]
    fn close_is_idempotent_on_already_closed() {
        let runner =
            MockRunner::with_outputs(vec![CommandResult::fail("constraint: issue already closed")]);
        let bd = client(runner);
        assert!(bd.close("hq-1", None).is_ok());
    }

    #[test]
    fn burn_batches_ids() {
        let runner = MockRunner::with_outputs(vec![CommandResult::ok("")]);
        let bd = client(runner);
        bd.burn(&["hq-1", "hq-2"]).unwrap();
        let argv = &bd.runner.calls()[0];
        assert_eq!(argv, &["bd", "burn", "hq-1", "hq-2"]);
    }

    #[test]
    fn burn_of_nothing_skips_subprocess() {
        let runner = MockRunner::default();
        let bd = client(runner);
        bd.burn(&[]).unwrap();
        assert!(bd.runner.calls().is_empty());
    }

    #[test]
    fn ready_parses_view() {
        let runner = MockRunner::with_outputs(vec![CommandResult::ok(
            r#"[{"id":"bd-a","title":"Fix parser","issue_type":"task","status":"open"}]"#,
        )]);
        let bd = client(runner);
        let ready = bd.ready().unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "bd-a");
        assert_eq!(ready[0].issue_type, "task");
    }

    #[test]
    fn transport_errors_carry_stderr() {
        let runner = MockRunner::with_outputs(vec![CommandResult::fail("bd: daemon unreachable")]);
        let bd = client(runner);
        match bd.list(&ListFilter::default()) {
            Err(StoreError::Transport(msg)) => assert!(msg.contains("daemon unreachable")),
            other => panic!("expected transport error, got {other:?}"),
        }
    }
}
