//! Local witness state: `<rig>/.runtime/witness.json`.
//!
//! Single writer (the supervisor), atomic writes, readable by anyone. The
//! `spawned_issues` list doubles as a scratch log: bare entries are issue
//! ids the witness has spawned for (unique), tagged entries (`nudge:`,
//! `done:`, `waiting:<name>:<ts>`) track per-worker protocol progress.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::format_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Stopped,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessConfig {
    #[serde(default)]
    pub auto_spawn: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_spawn_delay_ms")]
    pub spawn_delay_ms: u64,
    /// Only spawn for issues that block this epic.
    #[serde(default)]
    pub epic_id: Option<String>,
    /// Only spawn for issue ids with this prefix.
    #[serde(default)]
    pub issue_prefix: Option<String>,
}

fn default_max_workers() -> usize {
    4
}

fn default_spawn_delay_ms() -> u64 {
    5000
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            auto_spawn: false,
            max_workers: default_max_workers(),
            spawn_delay_ms: default_spawn_delay_ms(),
            epic_id: None,
            issue_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    #[serde(default)]
    pub total_checks: u64,
    #[serde(default)]
    pub today_checks: u64,
    #[serde(default)]
    pub total_nudges: u64,
    #[serde(default)]
    pub today_nudges: u64,
    #[serde(default)]
    pub total_escalations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessState {
    pub rig_name: String,
    #[serde(default)]
    pub state: RunState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub monitored_polecats: Vec<String>,
    #[serde(default)]
    pub spawned_issues: Vec<String>,
    #[serde(default)]
    pub stats: Stats,
    #[serde(default)]
    pub config: WitnessConfig,
}

impl WitnessState {
    pub fn new(rig_name: &str) -> Self {
        Self {
            rig_name: rig_name.to_string(),
            state: RunState::Stopped,
            started_at: None,
            last_check_at: None,
            monitored_polecats: Vec::new(),
            spawned_issues: Vec::new(),
            stats: Stats::default(),
            config: WitnessConfig::default(),
        }
    }

    pub fn file_path(rig_path: &Path) -> PathBuf {
        rig_path.join(".runtime").join("witness.json")
    }

    /// Load from disk; a missing file yields a fresh stopped state.
    pub fn load(rig_path: &Path, rig_name: &str) -> Result<Self> {
        let path = Self::file_path(rig_path);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(rig_name));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Persist via temp + rename so readers never see a partial document.
    pub fn save(&self, rig_path: &Path) -> Result<()> {
        let path = Self::file_path(rig_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let data = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, data)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }

    // Scratch-log operations over `spawned_issues`.

    /// Record an issue the witness spawned a worker for. Issue ids never
    /// repeat in the scratch.
    pub fn record_spawned(&mut self, issue_id: &str) {
        if !self.is_spawned(issue_id) {
            self.spawned_issues.push(issue_id.to_string());
        }
    }

    pub fn is_spawned(&self, issue_id: &str) -> bool {
        self.spawned_issues.iter().any(|e| e == issue_id)
    }

    pub fn record_done(&mut self, name: &str) {
        let key = format!("done:{name}");
        if !self.spawned_issues.iter().any(|e| *e == key) {
            self.spawned_issues.push(key);
        }
    }

    pub fn has_done(&self, name: &str) -> bool {
        let key = format!("done:{name}");
        self.spawned_issues.iter().any(|e| *e == key)
    }

    /// Nudge tags may repeat; they are a count, not a set.
    pub fn record_nudge_tag(&mut self, name: &str) {
        self.spawned_issues.push(format!("nudge:{name}"));
    }

    pub fn nudge_tag_count(&self, name: &str) -> usize {
        let key = format!("nudge:{name}");
        self.spawned_issues.iter().filter(|e| **e == key).count()
    }

    pub fn record_waiting(&mut self, name: &str, since: DateTime<Utc>) {
        self.spawned_issues
            .push(format!("waiting:{name}:{}", format_rfc3339(since)));
    }

    pub fn waiting_since(&self, name: &str) -> Option<DateTime<Utc>> {
        let prefix = format!("waiting:{name}:");
        self.spawned_issues.iter().find_map(|e| {
            let ts = e.strip_prefix(&prefix)?;
            DateTime::parse_from_rfc3339(ts)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
    }

    pub fn clear_waiting(&mut self, name: &str) {
        let prefix = format!("waiting:{name}:");
        self.spawned_issues.retain(|e| !e.starts_with(&prefix));
    }

    /// Roll the per-day counters when the date changes.
    pub fn roll_day(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_check_at
            && last.date_naive() != now.date_naive()
        {
            self.stats.today_checks = 0;
            self.stats.today_nudges = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn missing_file_loads_default() {
        let tmp = tempfile::tempdir().unwrap();
        let state = WitnessState::load(tmp.path(), "gastown").unwrap();
        assert_eq!(state.rig_name, "gastown");
        assert_eq!(state.state, RunState::Stopped);
        assert!(state.spawned_issues.is_empty());
    }

    #[test]
    fn save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = WitnessState::new("gastown");
        state.state = RunState::Running;
        state.record_spawned("bd-1");
        state.record_done("Toast");
        state.stats.total_checks = 7;
        state.save(tmp.path()).unwrap();

        let loaded = WitnessState::load(tmp.path(), "gastown").unwrap();
        assert_eq!(loaded.state, RunState::Running);
        assert!(loaded.is_spawned("bd-1"));
        assert!(loaded.has_done("Toast"));
        assert_eq!(loaded.stats.total_checks, 7);
        // The temp file is gone after the rename.
        assert!(!tmp.path().join(".runtime").join("witness.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".runtime")).unwrap();
        std::fs::write(tmp.path().join(".runtime").join("witness.json"), "{oops").unwrap();
        assert!(WitnessState::load(tmp.path(), "gastown").is_err());
    }

    #[test]
    fn spawned_issue_ids_never_duplicate() {
        let mut state = WitnessState::new("gastown");
        state.record_spawned("bd-1");
        state.record_spawned("bd-1");
        assert_eq!(
            state.spawned_issues.iter().filter(|e| **e == "bd-1").count(),
            1
        );
    }

    #[test]
    fn nudge_tags_count_repeats() {
        let mut state = WitnessState::new("gastown");
        state.record_nudge_tag("Toast");
        state.record_nudge_tag("Toast");
        assert_eq!(state.nudge_tag_count("Toast"), 2);
        assert_eq!(state.nudge_tag_count("Rictus"), 0);
    }

    #[test]
    fn waiting_tag_roundtrips_timestamp() {
        let mut state = WitnessState::new("gastown");
        let ts = Utc.with_ymd_and_hms(2025, 11, 4, 12, 0, 0).unwrap();
        state.record_waiting("Joe", ts);
        assert_eq!(state.waiting_since("Joe"), Some(ts));

        state.clear_waiting("Joe");
        assert_eq!(state.waiting_since("Joe"), None);
    }

    #[test]
    fn clear_waiting_does_not_clip_similar_names() {
        let mut state = WitnessState::new("gastown");
        let ts = Utc.with_ymd_and_hms(2025, 11, 4, 12, 0, 0).unwrap();
        state.record_waiting("Joe", ts);
        state.record_waiting("Joey", ts);
        state.clear_waiting("Joe");
        assert_eq!(state.waiting_since("Joe"), None);
        assert_eq!(state.waiting_since("Joey"), Some(ts));
    }

    #[test]
    fn day_roll_resets_today_counters() {
        let mut state = WitnessState::new("gastown");
        state.stats.today_checks = 5;
        state.stats.total_checks = 9;
        state.last_check_at = Some(Utc.with_ymd_and_hms(2025, 11, 3, 23, 0, 0).unwrap());
        state.roll_day(Utc.with_ymd_and_hms(2025, 11, 4, 1, 0, 0).unwrap());
        assert_eq!(state.stats.today_checks, 0);
        assert_eq!(state.stats.total_checks, 9);
    }

    #[test]
    fn config_defaults() {
        let config = WitnessConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.spawn_delay_ms, 5000);
        assert!(!config.auto_spawn);
    }
}
