//! Agent messaging over the issue store.
//!
//! A message is an issue with `type=message`: the subject is the title, the
//! body the description, the recipient identity the assignee, and read
//! state is open/closed. Everything else (sender, thread, reply-to, message
//! type) rides in labels so the store stays schema-free.

mod mailbox;
mod router;

pub use mailbox::{Mailbox, SearchOptions};
pub use router::Router;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::identity_to_address;
use crate::beads::Issue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Store integer encoding: 0=urgent, 1=high, 2=normal, 3=low.
    pub fn to_beads(self) -> i64 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// 4 is the store's backlog bucket, folded into low. Anything else is
    /// treated as normal.
    pub fn from_beads(p: i64) -> Self {
        match p {
            0 => Priority::Urgent,
            1 => Priority::High,
            2 => Priority::Normal,
            3 | 4 => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Requires action from the recipient.
    Task,
    /// Optional first-come-first-served work.
    Scavenge,
    #[default]
    Notification,
    Reply,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Task => "task",
            MessageType::Scavenge => "scavenge",
            MessageType::Notification => "notification",
            MessageType::Reply => "reply",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "task" => MessageType::Task,
            "scavenge" => MessageType::Scavenge,
            "reply" => MessageType::Reply,
            _ => MessageType::Notification,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Recipient polls the mailbox. The default.
    #[default]
    Queue,
    /// Injected straight into the recipient's session.
    Interrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    /// True when the underlying issue is closed.
    pub read: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub delivery: Delivery,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    /// Ephemeral: kept in the local store, never exported.
    #[serde(default)]
    pub wisp: bool,
}

impl Message {
    /// Materialize a message from its store representation.
    pub fn from_issue(issue: &Issue) -> Self {
        let mut sender = String::new();
        let mut thread_id = None;
        let mut reply_to = None;
        let mut msg_type = MessageType::Notification;

        for label in &issue.labels {
            if let Some(v) = label.strip_prefix("from:") {
                sender = v.to_string();
            } else if let Some(v) = label.strip_prefix("thread:") {
                thread_id = Some(v.to_string());
            } else if let Some(v) = label.strip_prefix("reply-to:") {
                reply_to = Some(v.to_string());
            } else if let Some(v) = label.strip_prefix("msg-type:") {
                msg_type = MessageType::parse(v);
            }
        }

        Self {
            id: issue.id.clone(),
            from: identity_to_address(&sender),
            to: identity_to_address(&issue.assignee),
            cc: Vec::new(),
            subject: issue.title.clone(),
            body: issue.description.clone(),
            timestamp: issue.created_at.unwrap_or_else(Utc::now),
            read: issue.status == "closed",
            priority: Priority::from_beads(issue.priority),
            msg_type,
            delivery: Delivery::Queue,
            thread_id,
            reply_to,
            pinned: issue.pinned,
            wisp: issue.wisp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue() -> Issue {
        serde_json::from_str(
            r#"{"id":"hq-1","title":"Status check","description":"how goes it",
                "assignee":"gastown/polecats/Toast","status":"open","priority":1,
                "labels":["from:mayor/","thread:thread-abc","msg-type:task"],
                "wisp":true}"#,
        )
        .unwrap()
    }

    #[test]
    fn priority_beads_roundtrip() {
        for p in [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low] {
            assert_eq!(Priority::from_beads(p.to_beads()), p);
        }
        assert_eq!(Priority::from_beads(4), Priority::Low);
        assert_eq!(Priority::from_beads(99), Priority::Normal);
    }

    #[test]
    fn message_type_parse_defaults_to_notification() {
        assert_eq!(MessageType::parse("task"), MessageType::Task);
        assert_eq!(MessageType::parse("bogus"), MessageType::Notification);
    }

    #[test]
    fn from_issue_extracts_label_metadata() {
        let msg = Message::from_issue(&issue());
        assert_eq!(msg.from, "mayor/");
        assert_eq!(msg.to, "gastown/Toast"); // normalized
        assert_eq!(msg.thread_id.as_deref(), Some("thread-abc"));
        assert_eq!(msg.msg_type, MessageType::Task);
        assert_eq!(msg.priority, Priority::High);
        assert!(!msg.read);
        assert!(msg.wisp);
    }

    #[test]
    fn closed_issue_is_read() {
        let mut raw = issue();
        raw.status = "closed".to_string();
        assert!(Message::from_issue(&raw).read);
    }
}
