//! Handoff state: the store-backed half of the worker model.
//!
//! Nudge counters and activity stamps must outlive wisp burns and witness
//! restarts, so they live in a pinned issue with a well-known id. The
//! issue's description is human-readable prose followed by a fenced JSON
//! block; the parser finds the first `{` and its matching close brace with
//! string/escape awareness, so surrounding prose never confuses it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::beads::{BeadsClient, CreateSpec, UpdatePatch};
use crate::errors::StoreError;
use crate::subprocess::CommandRunner;

/// Well-known handoff issue id for a rig.
pub fn handoff_issue_id(rig_name: &str) -> String {
    format!("gt-{rig_name}-witness-handoff")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    #[serde(default)]
    pub nudge_count: u32,
    #[serde(default)]
    pub last_nudge: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_active: Option<DateTime<Utc>>,
    #[serde(default)]
    pub issue: Option<String>,
    /// Child tracker issue bonded to the patrol instance.
    #[serde(default)]
    pub arm_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffState {
    #[serde(default)]
    pub worker_states: BTreeMap<String, WorkerState>,
    #[serde(default)]
    pub patrol_instance_id: Option<String>,
    #[serde(default)]
    pub last_patrol: Option<DateTime<Utc>>,
}

impl HandoffState {
    pub fn nudge_count(&self, name: &str) -> u32 {
        self.worker_states
            .get(name)
            .map(|ws| ws.nudge_count)
            .unwrap_or(0)
    }

    pub fn record_nudge(&mut self, name: &str, now: DateTime<Utc>) {
        let ws = self.worker_states.entry(name.to_string()).or_default();
        ws.nudge_count += 1;
        ws.last_nudge = Some(now);
    }

    pub fn clear_nudge_count(&mut self, name: &str, now: DateTime<Utc>) {
        if let Some(ws) = self.worker_states.get_mut(name) {
            ws.nudge_count = 0;
            ws.last_nudge = None;
            ws.last_active = Some(now);
        }
    }

    /// Stamp activity; an active worker's nudge count resets.
    pub fn update_activity(&mut self, name: &str, issue: Option<&str>, now: DateTime<Utc>) {
        let ws = self.worker_states.entry(name.to_string()).or_default();
        ws.last_active = Some(now);
        if let Some(issue) = issue {
            ws.issue = Some(issue.to_string());
        }
        if ws.nudge_count > 0 {
            ws.nudge_count = 0;
            ws.last_nudge = None;
        }
    }

    /// Drop a worker's entry after it has been cleaned.
    pub fn prune_worker(&mut self, name: &str) {
        self.worker_states.remove(name);
    }
}

/// Find the index of the `}` matching the `{` at the start of `s`,
/// skipping braces inside JSON strings and escape sequences.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a handoff description. Any failure degrades to an empty state —
/// a corrupted handoff must never stop the patrol.
pub fn parse_description(desc: &str) -> HandoffState {
    let Some(start) = desc.find('{') else {
        return HandoffState::default();
    };
    let json_part = &desc[start..];
    let Some(end) = find_matching_brace(json_part) else {
        return HandoffState::default();
    };
    serde_json::from_str(&json_part[..=end]).unwrap_or_default()
}

/// Render the description stored in the handoff issue.
pub fn render_description(rig_name: &str, state: &HandoffState) -> String {
    let json = serde_json::to_string_pretty(state).unwrap_or_else(|_| "{}".to_string());
    format!("Witness handoff state for {rig_name}.\n\n```json\n{json}\n```")
}

/// Store access for the handoff issue.
pub struct HandoffStore<R: CommandRunner> {
    client: BeadsClient<R>,
    rig_name: String,
}

impl<R: CommandRunner> HandoffStore<R> {
    pub fn new(client: BeadsClient<R>, rig_name: &str) -> Self {
        Self {
            client,
            rig_name: rig_name.to_string(),
        }
    }

    pub fn issue_id(&self) -> String {
        handoff_issue_id(&self.rig_name)
    }

    /// Load the handoff state, creating the issue on first use. Transport
    /// failures propagate; a missing or unparseable document degrades to
    /// an empty state.
    pub fn load(&self) -> Result<HandoffState, StoreError> {
        match self.client.show(&[&self.issue_id()]) {
            Ok(issues) => Ok(parse_description(&issues[0].description)),
            Err(StoreError::NotFound) => {
                self.ensure()?;
                Ok(HandoffState::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the whole document. Last writer wins; there is one
    /// supervisor per rig.
    pub fn save(&self, state: &HandoffState) -> Result<(), StoreError> {
        self.client.update(
            &self.issue_id(),
            &UpdatePatch {
                description: Some(render_description(&self.rig_name, state)),
                ..Default::default()
            },
        )
    }

    /// Create the handoff issue if absent. Racing an existing issue is
    /// success; pinning is best-effort since not every store supports it.
    pub fn ensure(&self) -> Result<(), StoreError> {
        let id = self.issue_id();
        let spec = CreateSpec {
            id: Some(id.clone()),
            issue_type: Some("task".to_string()),
            title: format!("Witness handoff state ({})", self.rig_name),
            description: render_description(&self.rig_name, &HandoffState::default()),
            priority: Some(4),
            ..Default::default()
        };

        match self.client.create(&spec) {
            Ok(_) => {}
            Err(StoreError::Constraint(msg)) if msg.to_lowercase().contains("already exists") => {
                debug!(id, "handoff issue already exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.client.update(
            &id,
            &UpdatePatch {
                pinned: Some(true),
                ..Default::default()
            },
        ) {
            warn!(id, error = %e, "could not pin handoff issue");
        }
        Ok(())
    }
}
