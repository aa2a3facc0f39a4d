//! Town and rig discovery.
//!
//! A town is the top-level workspace: it holds the shared `.beads` store,
//! `config/messaging.json`, and one directory per rig. A rig contains the
//! canonical clone (`mayor/rig`), a `polecats/` directory of ephemeral
//! worktrees, and `.runtime/` state. Rigs are created by `rig add`; the
//! supervisor only reads them.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use crate::address::IdentityEnv;

/// Locate the town root: `GT_TOWN` if set, otherwise walk up from `start`
/// until a directory containing `.beads` is found.
pub fn find_town_root(env: &IdentityEnv, start: &Path) -> Result<PathBuf> {
    if let Some(town) = &env.town {
        let path = PathBuf::from(town);
        if path.join(".beads").is_dir() {
            return Ok(path);
        }
        bail!("GT_TOWN={} does not contain a .beads directory", town);
    }

    let mut dir = start.to_path_buf();
    loop {
        if dir.join(".beads").is_dir() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!(
                "not in a Gas Town workspace (no .beads directory above {})",
                start.display()
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rig {
    pub name: String,
    pub path: PathBuf,
}

impl Rig {
    /// Load a rig by name under a town root. The rig directory must exist.
    pub fn load(town_root: &Path, name: &str) -> Result<Self> {
        let path = town_root.join(name);
        if !path.is_dir() {
            bail!("rig '{}' not found under {}", name, town_root.display());
        }
        Ok(Self {
            name: name.to_string(),
            path,
        })
    }

    /// Current polecat worker names, one per directory under `polecats/`.
    pub fn polecats(&self) -> Result<Vec<String>> {
        let dir = self.path.join("polecats");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Worktree path for a polecat.
    pub fn polecat_path(&self, name: &str) -> PathBuf {
        self.path.join("polecats").join(name)
    }

    /// The rig's canonical clone, where branches are deleted after cleanup.
    pub fn canonical_clone(&self) -> PathBuf {
        self.path.join("mayor").join("rig")
    }

    /// tmux session name for a worker in this rig.
    pub fn session_name(&self, worker: &str) -> String {
        format!("gt-{}-{}", self.name, worker)
    }
}
