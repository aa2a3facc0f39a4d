//! Agent addressing and identity detection.
//!
//! Addresses are path-shaped: `mayor/`, `deacon/`, `<rig>/witness`,
//! `<rig>/refinery`, `<rig>/<worker>`, `<rig>/crew/<name>`,
//! `<rig>/polecats/<name>`, plus the router-only classes `list:<name>` and
//! `queue:<name>`. Canonicalization is liberal on input and strict on
//! output: `rig/polecats/X` and `rig/crew/X` both collapse to `rig/X`, and
//! the town-level agents always carry a trailing slash.

use std::path::Path;

/// Convert an address to the canonical store identity.
pub fn address_to_identity(address: &str) -> String {
    if address == "mayor" || address == "mayor/" {
        return "mayor/".to_string();
    }
    if address == "deacon" || address == "deacon/" {
        return "deacon/".to_string();
    }

    let trimmed = address.strip_suffix('/').unwrap_or(address);

    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.len() == 3 && (parts[1] == "crew" || parts[1] == "polecats") {
        return format!("{}/{}", parts[0], parts[2]);
    }

    trimmed.to_string()
}

/// Convert a store identity back to an address. Identities are already
/// near-canonical; this normalizes the same variants on the way out.
pub fn identity_to_address(identity: &str) -> String {
    if identity == "mayor" || identity == "mayor/" {
        return "mayor/".to_string();
    }
    if identity == "deacon" || identity == "deacon/" {
        return "deacon/".to_string();
    }

    let parts: Vec<&str> = identity.split('/').collect();
    if parts.len() == 3 && (parts[1] == "crew" || parts[1] == "polecats") {
        return format!("{}/{}", parts[0], parts[2]);
    }

    identity.to_string()
}

/// Environment slice consulted by sender detection. Captured once so tests
/// can construct it without touching the process environment.
#[derive(Debug, Default, Clone)]
pub struct IdentityEnv {
    pub role: Option<String>,
    pub rig: Option<String>,
    pub polecat: Option<String>,
    pub crew: Option<String>,
    pub town: Option<String>,
}

impl IdentityEnv {
    pub fn from_process() -> Self {
        Self {
            role: std::env::var("GT_ROLE").ok().filter(|s| !s.is_empty()),
            rig: std::env::var("GT_RIG").ok().filter(|s| !s.is_empty()),
            polecat: std::env::var("GT_POLECAT").ok().filter(|s| !s.is_empty()),
            crew: std::env::var("GT_CREW").ok().filter(|s| !s.is_empty()),
            town: std::env::var("GT_TOWN").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// Sender address for a human at a terminal or an unrecognized directory.
pub const OVERSEER: &str = "overseer";

/// Determine the current context's address.
///
/// `GT_ROLE` is authoritative for agent sessions (every agent is spawned
/// with it set); cwd-based detection covers debugging sessions started by
/// hand inside an agent directory. Everything else is the overseer.
pub fn detect_sender(env: &IdentityEnv, cwd: &Path) -> String {
    match env.role.as_deref() {
        Some(role) => detect_sender_from_role(role, env, cwd),
        None => detect_sender_from_cwd(cwd),
    }
}

fn detect_sender_from_role(role: &str, env: &IdentityEnv, cwd: &Path) -> String {
    // GT_ROLE may already be a full address.
    if role.contains('/') {
        return role.to_string();
    }

    let rig = env.rig.as_deref();
    match role {
        "mayor" => "mayor/".to_string(),
        "deacon" => "deacon/".to_string(),
        "polecat" => match (rig, env.polecat.as_deref()) {
            (Some(rig), Some(polecat)) => format!("{rig}/{polecat}"),
            _ => detect_sender_from_cwd(cwd),
        },
        "crew" => match (rig, env.crew.as_deref()) {
            (Some(rig), Some(crew)) => format!("{rig}/crew/{crew}"),
            _ => detect_sender_from_cwd(cwd),
        },
        "witness" => match rig {
            Some(rig) => format!("{rig}/witness"),
            None => detect_sender_from_cwd(cwd),
        },
        "refinery" => match rig {
            Some(rig) => format!("{rig}/refinery"),
            None => detect_sender_from_cwd(cwd),
        },
        _ => detect_sender_from_cwd(cwd),
    }
}

fn detect_sender_from_cwd(cwd: &Path) -> String {
    let cwd = cwd.to_string_lossy();

    for (marker, kind) in [("/polecats/", "polecats"), ("/crew/", "crew")] {
        if let Some(idx) = cwd.find(marker) {
            let rig_name = Path::new(&cwd[..idx])
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let rest = &cwd[idx + marker.len()..];
            let worker = rest.split('/').next().unwrap_or_default();
            if !rig_name.is_empty() && !worker.is_empty() {
                return format!("{rig_name}/{kind}/{worker}");
            }
        }
    }

    for (marker, role) in [("/refinery", "refinery"), ("/witness", "witness")] {
        if let Some(idx) = cwd.find(marker) {
            let rig_name = Path::new(&cwd[..idx])
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !rig_name.is_empty() {
                return format!("{rig_name}/{role}");
            }
        }
    }

    OVERSEER.to_string()
}

/// Check a caller against a queue worker pattern. A single `*` matches
/// exactly one slash-free segment: `gastown/polecats/*` matches
/// `gastown/polecats/capable` but not `gastown/polecats/a/b`.
pub fn match_worker_pattern(pattern: &str, caller: &str) -> bool {
    if pattern == caller {
        return true;
    }

    if let Some(star) = pattern.find('*') {
        let (prefix, suffix) = (&pattern[..star], &pattern[star + 1..]);
        if suffix.contains('*') {
            return false;
        }
        if caller.len() >= prefix.len() + suffix.len()
            && caller.starts_with(prefix)
            && caller.ends_with(suffix)
        {
            let middle = &caller[prefix.len()..caller.len() - suffix.len()];
            return !middle.is_empty() && !middle.contains('/');
        }
    }

    false
}
