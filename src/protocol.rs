//! Lifecycle protocol codec.
//!
//! Protocol messages ride ordinary mail: the kind is keyed off the subject
//! line, structured fields ride the body as `Key: value` lines. Decoding is
//! strict — a subject that matches a protocol but carries a malformed
//! payload is a decode error, and the dispatcher must NOT acknowledge the
//! message (it reappears next tick so a human can intervene). Encoding is
//! the exact inverse: `decode(encode(p)) == p`.

use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("protocol decode error: {0}")]
pub struct DecodeError(pub String);

static PATTERN_POLECAT_DONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^POLECAT_DONE\s+(\S+)\s*$").unwrap());
static PATTERN_LIFECYCLE_SHUTDOWN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^LIFECYCLE:Shutdown\s+(\S+)\s*$").unwrap());
static PATTERN_HELP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^HELP:\s+(\S+)\s+on\s+(\S+)\s*$").unwrap());
static PATTERN_MERGED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^MERGED\s+(\S+)\s*$").unwrap());
static PATTERN_SWARM_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SWARM_START\s+(\S+)\s*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolecatDonePayload {
    pub polecat_name: String,
    pub issue_id: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleShutdownPayload {
    pub polecat_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelpPayload {
    pub agent: String,
    pub issue_id: String,
    pub topic: String,
    pub problem: String,
    pub tried: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPayload {
    pub polecat_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmStartPayload {
    pub swarm_id: String,
    pub total: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    PolecatDone(PolecatDonePayload),
    LifecycleShutdown(LifecycleShutdownPayload),
    Help(HelpPayload),
    Merged(MergedPayload),
    SwarmStart(SwarmStartPayload),
}

impl ProtocolEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolEvent::PolecatDone(_) => "POLECAT_DONE",
            ProtocolEvent::LifecycleShutdown(_) => "LIFECYCLE:Shutdown",
            ProtocolEvent::Help(_) => "HELP",
            ProtocolEvent::Merged(_) => "MERGED",
            ProtocolEvent::SwarmStart(_) => "SWARM_START",
        }
    }
}

/// Decode a subject/body pair.
///
/// Returns `Ok(None)` for ordinary mail that is not protocol-shaped;
/// `Err(DecodeError)` only when the subject names a protocol but the
/// payload does not parse.
pub fn decode(subject: &str, body: &str) -> Result<Option<ProtocolEvent>, DecodeError> {
    let subject = subject.trim();

    if let Some(caps) = PATTERN_POLECAT_DONE.captures(subject) {
        let fields = parse_body_fields(body);
        return Ok(Some(ProtocolEvent::PolecatDone(PolecatDonePayload {
            polecat_name: caps[1].to_string(),
            issue_id: fields.get("Issue").cloned(),
            branch: fields.get("Branch").cloned(),
        })));
    }

    if let Some(caps) = PATTERN_LIFECYCLE_SHUTDOWN.captures(subject) {
        return Ok(Some(ProtocolEvent::LifecycleShutdown(
            LifecycleShutdownPayload {
                polecat_name: caps[1].to_string(),
            },
        )));
    }

    if let Some(caps) = PATTERN_HELP.captures(subject) {
        let fields = parse_body_fields(body);
        let topic = require_field(&fields, "Topic")?;
        let problem = require_field(&fields, "Problem")?;
        let tried = require_field(&fields, "Tried")?;
        let requested_at = parse_rfc3339(&require_field(&fields, "Requested-At")?)?;
        return Ok(Some(ProtocolEvent::Help(HelpPayload {
            agent: caps[1].to_string(),
            issue_id: caps[2].to_string(),
            topic,
            problem,
            tried,
            requested_at,
        })));
    }

    if let Some(caps) = PATTERN_MERGED.captures(subject) {
        return Ok(Some(ProtocolEvent::Merged(MergedPayload {
            polecat_name: caps[1].to_string(),
        })));
    }

    if let Some(caps) = PATTERN_SWARM_START.captures(subject) {
        let fields = parse_body_fields(body);
        let total = require_field(&fields, "Total")?
            .parse::<usize>()
            .map_err(|_| DecodeError("Total is not a number".to_string()))?;
        let started_at = parse_rfc3339(&require_field(&fields, "Started-At")?)?;
        return Ok(Some(ProtocolEvent::SwarmStart(SwarmStartPayload {
            swarm_id: caps[1].to_string(),
            total,
            started_at,
        })));
    }

    Ok(None)
}

/// Encode an event into a (subject, body) pair the decoder accepts.
pub fn encode(event: &ProtocolEvent) -> (String, String) {
    match event {
        ProtocolEvent::PolecatDone(p) => {
            let mut body = Vec::new();
            if let Some(issue) = &p.issue_id {
                body.push(format!("Issue: {issue}"));
            }
            if let Some(branch) = &p.branch {
                body.push(format!("Branch: {branch}"));
            }
            (format!("POLECAT_DONE {}", p.polecat_name), body.join("\n"))
        }
        ProtocolEvent::LifecycleShutdown(p) => {
            (format!("LIFECYCLE:Shutdown {}", p.polecat_name), String::new())
        }
        ProtocolEvent::Help(p) => (
            format!("HELP: {} on {}", p.agent, p.issue_id),
            format!(
                "Topic: {}\nProblem: {}\nTried: {}\nRequested-At: {}",
                p.topic,
                p.problem,
                p.tried,
                format_rfc3339(p.requested_at)
            ),
        ),
        ProtocolEvent::Merged(p) => (format!("MERGED {}", p.polecat_name), String::new()),
        ProtocolEvent::SwarmStart(p) => (
            format!("SWARM_START {}", p.swarm_id),
            format!(
                "Total: {}\nStarted-At: {}",
                p.total,
                format_rfc3339(p.started_at)
            ),
        ),
    }
}

/// Parse `Key: value` lines. First occurrence of a key wins; lines without
/// a colon are ignored (free prose is allowed around the fields).
fn parse_body_fields(body: &str) -> std::collections::HashMap<String, String> {
    let mut fields = std::collections::HashMap::new();
    for line in body.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if key.is_empty() || key.contains(' ') {
                continue;
            }
            fields
                .entry(key.to_string())
                .or_insert_with(|| value.trim().to_string());
        }
    }
    fields
}

fn require_field(
    fields: &std::collections::HashMap<String, String>,
    key: &str,
) -> Result<String, DecodeError> {
    fields
        .get(key)
        .cloned()
        .ok_or_else(|| DecodeError(format!("missing body field '{key}'")))
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DecodeError(format!("bad timestamp '{value}': {e}")))
}

pub fn format_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 4, 16, 30, 0).unwrap()
    }

    #[test]
    fn polecat_done_roundtrip() {
        for payload in [
            PolecatDonePayload {
                polecat_name: "Toast".to_string(),
                issue_id: Some("bd-123".to_string()),
                branch: Some("polecat/Toast".to_string()),
            },
            PolecatDonePayload {
                polecat_name: "Rictus".to_string(),
                issue_id: None,
                branch: None,
            },
        ] {
            let event = ProtocolEvent::PolecatDone(payload);
            let (subject, body) = encode(&event);
            assert_eq!(decode(&subject, &body).unwrap(), Some(event));
        }
    }

    #[test]
    fn lifecycle_shutdown_roundtrip() {
        let event = ProtocolEvent::LifecycleShutdown(LifecycleShutdownPayload {
            polecat_name: "Toast".to_string(),
        });
        let (subject, body) = encode(&event);
        assert_eq!(subject, "LIFECYCLE:Shutdown Toast");
        assert_eq!(decode(&subject, &body).unwrap(), Some(event));
    }

    #[test]
    fn help_roundtrip() {
        let event = ProtocolEvent::Help(HelpPayload {
            agent: "gastown/Toast".to_string(),
            issue_id: "bd-42".to_string(),
            topic: "merge conflict".to_string(),
            problem: "rebase failed twice".to_string(),
            tried: "git rebase --abort, retried".to_string(),
            requested_at: ts(),
        });
        let (subject, body) = encode(&event);
        assert_eq!(subject, "HELP: gastown/Toast on bd-42");
        assert_eq!(decode(&subject, &body).unwrap(), Some(event));
    }

    #[test]
    fn merged_roundtrip() {
        let event = ProtocolEvent::Merged(MergedPayload {
            polecat_name: "Toast".to_string(),
        });
        let (subject, body) = encode(&event);
        assert_eq!(decode(&subject, &body).unwrap(), Some(event));
    }

    #[test]
    fn swarm_start_roundtrip() {
        let event = ProtocolEvent::SwarmStart(SwarmStartPayload {
            swarm_id: "swarm-7".to_string(),
            total: 10,
            started_at: ts(),
        });
        let (subject, body) = encode(&event);
        assert_eq!(subject, "SWARM_START swarm-7");
        assert!(body.contains("Total: 10"));
        assert_eq!(decode(&subject, &body).unwrap(), Some(event));
    }

    #[test]
    fn ordinary_mail_is_not_protocol() {
        assert_eq!(decode("Status check", "how is it going?").unwrap(), None);
        assert_eq!(decode("Re: NUDGE", "still here").unwrap(), None);
    }

    #[test]
    fn malformed_help_payload_is_decode_error() {
        // Subject parses, body is missing required fields.
        let err = decode("HELP: gastown/Toast on bd-42", "Topic: stuck").unwrap_err();
        assert!(err.to_string().contains("Problem"));
    }

    #[test]
    fn malformed_swarm_total_is_decode_error() {
        let body = "Total: many\nStarted-At: 2025-11-04T16:30:00Z";
        assert!(decode("SWARM_START swarm-7", body).is_err());
    }

    #[test]
    fn bad_timestamp_is_decode_error() {
        let body = "Total: 3\nStarted-At: yesterday";
        assert!(decode("SWARM_START swarm-7", body).is_err());
    }

    #[test]
    fn subject_without_name_does_not_match() {
        // "POLECAT_DONE" with no argument is not protocol-shaped at all.
        assert_eq!(decode("POLECAT_DONE", "").unwrap(), None);
    }

    #[test]
    fn body_prose_around_fields_is_tolerated() {
        let body = "The batch is rolling.\n\nTotal: 4\nStarted-At: 2025-11-04T16:30:00Z\nGood luck.";
        let event = decode("SWARM_START swarm-9", body).unwrap().unwrap();
        match event {
            ProtocolEvent::SwarmStart(p) => assert_eq!(p.total, 4),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
