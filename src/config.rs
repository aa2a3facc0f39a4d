//! Messaging configuration: queues, mailing lists, announce channels.
//!
//! Lives at `<town>/config/messaging.json`. Queue worker lists use the
//! single-segment wildcard pattern from `address::match_worker_pattern`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueueConfig {
    /// Worker address patterns eligible to claim from this queue.
    #[serde(default)]
    pub workers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnnounceChannel {
    #[serde(default)]
    pub readers: Vec<String>,
    #[serde(default = "default_retain")]
    pub retain_count: usize,
}

fn default_retain() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MessagingConfig {
    #[serde(default)]
    pub queues: HashMap<String, QueueConfig>,
    #[serde(default)]
    pub announce_channels: HashMap<String, AnnounceChannel>,
    /// Mailing lists: list name to member addresses.
    #[serde(default)]
    pub lists: HashMap<String, Vec<String>>,
}

impl MessagingConfig {
    pub fn path(town_root: &Path) -> PathBuf {
        town_root.join("config").join("messaging.json")
    }

    /// Load the messaging config; a missing file means empty defaults.
    pub fn load(town_root: &Path) -> Result<Self> {
        let path = Self::path(town_root);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_file_is_empty_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MessagingConfig::load(tmp.path()).unwrap();
        assert!(config.queues.is_empty());
        assert!(config.lists.is_empty());
    }

    #[test]
    fn parse_queues_and_lists() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("config")).unwrap();
        fs::write(
            tmp.path().join("config").join("messaging.json"),
            r#"{
  "queues": {
    "work/gastown": { "workers": ["gastown/polecats/*", "gastown/crew/*"] }
  },
  "lists": { "oncall": ["mayor/", "gastown/witness"] },
  "announce_channels": { "alerts": { "readers": ["*"], "retain_count": 10 } }
}"#,
        )
        .unwrap();

        let config = MessagingConfig::load(tmp.path()).unwrap();
        assert_eq!(
            config.queues.get("work/gastown").unwrap().workers,
            vec!["gastown/polecats/*", "gastown/crew/*"]
        );
        assert_eq!(config.lists.get("oncall").unwrap().len(), 2);
        assert_eq!(config.announce_channels.get("alerts").unwrap().retain_count, 10);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("config")).unwrap();
        fs::write(tmp.path().join("config").join("messaging.json"), "{nope").unwrap();
        assert!(MessagingConfig::load(tmp.path()).is_err());
    }
}
