//! Per-address mailbox view.
//!
//! A mailbox materializes one identity's slice of the store: open issues
//! assigned to it, newest first. Crew workers that predate the store keep a
//! legacy JSONL inbox; both backends present the same operations, and the
//! legacy rewrite path is atomic (write temp, rename) so readers never see
//! a partial file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use regex::RegexBuilder;

use crate::address::address_to_identity;
use crate::beads::{BeadsClient, ListFilter};
use crate::errors::{MailError, StoreError};
use crate::subprocess::{CommandRunner, ShellCommandRunner};

use super::Message;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Regex pattern; matched case-insensitively.
    pub query: String,
    /// Substring filter on the sender address.
    pub from: Option<String>,
    /// Restrict matching to subjects.
    pub subject_only: bool,
    /// Restrict matching to bodies.
    pub body_only: bool,
    /// Include read (closed) messages.
    pub include_closed: bool,
}

enum Backend<R: CommandRunner> {
    Beads(BeadsClient<R>),
    /// Append-only JSONL file, one message per line.
    Legacy(PathBuf),
}

pub struct Mailbox<R: CommandRunner = ShellCommandRunner> {
    identity: String,
    backend: Backend<R>,
}

impl Mailbox<ShellCommandRunner> {
    /// Store-backed mailbox for an address.
    pub fn for_address(address: &str, town_root: &Path) -> Self {
        let client =
            BeadsClient::new(town_root).with_beads_dir(town_root.join(".beads"));
        Self::with_client(address, client)
    }

    /// Legacy JSONL mailbox rooted at a worker directory.
    #[allow(dead_code)]
    pub fn legacy(address: &str, dir: &Path) -> Self {
        Self {
            identity: address_to_identity(address),
            backend: Backend::Legacy(dir.join("inbox.jsonl")),
        }
    }
}

impl<R: CommandRunner> Mailbox<R> {
    pub fn with_client(address: &str, client: BeadsClient<R>) -> Self {
        Self {
            identity: address_to_identity(address),
            backend: Backend::Beads(client),
        }
    }

    #[allow(dead_code)]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Open messages for this identity, newest first.
    pub fn list(&self) -> Result<Vec<Message>, MailError> {
        match &self.backend {
            Backend::Beads(client) => {
                let filter = ListFilter {
                    issue_type: Some("message".to_string()),
                    assignee: Some(self.identity.clone()),
                    status: Some("open".to_string()),
                    ..Default::default()
                };
                let mut messages: Vec<Message> = client
                    .list(&filter)?
                    .iter()
                    .map(Message::from_issue)
                    .collect();
                messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                Ok(messages)
            }
            Backend::Legacy(path) => {
                let mut messages = read_jsonl(path)?;
                messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                Ok(messages)
            }
        }
    }

    pub fn list_unread(&self) -> Result<Vec<Message>, MailError> {
        // The store view only returns open (unread) messages already.
        let mut messages = self.list()?;
        messages.retain(|m| !m.read);
        Ok(messages)
    }

    pub fn get(&self, id: &str) -> Result<Message, MailError> {
        match &self.backend {
            Backend::Beads(client) => match client.show(&[id]) {
                Ok(issues) => Ok(Message::from_issue(&issues[0])),
                Err(StoreError::NotFound) => Err(MailError::MessageNotFound),
                Err(e) => Err(e.into()),
            },
            Backend::Legacy(_) => self
                .list()?
                .into_iter()
                .find(|m| m.id == id)
                .ok_or(MailError::MessageNotFound),
        }
    }

    /// Mark a message read by closing it in the store.
    pub fn mark_read(&self, id: &str) -> Result<(), MailError> {
        match &self.backend {
            Backend::Beads(client) => match client.close(id, None) {
                Ok(()) => Ok(()),
                Err(StoreError::NotFound) => Err(MailError::MessageNotFound),
                Err(e) => Err(e.into()),
            },
            Backend::Legacy(path) => {
                let mut messages = read_jsonl(path)?;
                let mut found = false;
                for msg in &mut messages {
                    if msg.id == id {
                        msg.read = true;
                        found = true;
                    }
                }
                if !found {
                    return Err(MailError::MessageNotFound);
                }
                rewrite_jsonl(path, &messages)
            }
        }
    }

    /// Delete a message. Store-backed mailboxes acknowledge by closing;
    /// the legacy file is rewritten without the message.
    pub fn delete(&self, id: &str) -> Result<(), MailError> {
        match &self.backend {
            Backend::Beads(_) => self.mark_read(id),
            Backend::Legacy(path) => {
                let messages = read_jsonl(path)?;
                let before = messages.len();
                let filtered: Vec<Message> =
                    messages.into_iter().filter(|m| m.id != id).collect();
                if filtered.len() == before {
                    return Err(MailError::MessageNotFound);
                }
                rewrite_jsonl(path, &filtered)
            }
        }
    }

    /// All messages in a thread, oldest first.
    pub fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Message>, MailError> {
        let mut messages = match &self.backend {
            Backend::Beads(client) => client
                .message_thread(thread_id)?
                .iter()
                .map(Message::from_issue)
                .collect::<Vec<_>>(),
            Backend::Legacy(_) => self
                .list()?
                .into_iter()
                .filter(|m| m.thread_id.as_deref() == Some(thread_id))
                .collect(),
        };
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(messages)
    }

    /// Regex search over subject and/or body, case-insensitive by default.
    pub fn search(&self, options: &SearchOptions) -> Result<Vec<Message>, MailError> {
        let re = RegexBuilder::new(&options.query)
            .case_insensitive(true)
            .build()
            .map_err(|e| MailError::Store(StoreError::Constraint(format!("bad pattern: {e}"))))?;

        let candidates = match &self.backend {
            Backend::Beads(client) => {
                let filter = ListFilter {
                    issue_type: Some("message".to_string()),
                    assignee: Some(self.identity.clone()),
                    status: (!options.include_closed).then(|| "open".to_string()),
                    ..Default::default()
                };
                client
                    .list(&filter)?
                    .iter()
                    .map(Message::from_issue)
                    .collect::<Vec<_>>()
            }
            Backend::Legacy(path) => read_jsonl(path)?,
        };

        let mut hits: Vec<Message> = candidates
            .into_iter()
            .filter(|m| {
                if !options.include_closed && m.read {
                    return false;
                }
                if let Some(from) = &options.from
                    && !m.from.contains(from.as_str())
                {
                    return false;
                }
                let in_subject = !options.body_only && re.is_match(&m.subject);
                let in_body = !options.subject_only && re.is_match(&m.body);
                in_subject || in_body
            })
            .collect();
        hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(hits)
    }

    /// `(total, unread)`. The store view only holds unread messages, so the
    /// two are equal there.
    pub fn count(&self) -> Result<(usize, usize), MailError> {
        let messages = self.list()?;
        let unread = messages.iter().filter(|m| !m.read).count();
        Ok((messages.len(), unread))
    }

    /// Append to a legacy mailbox. Store-backed mail goes through the
    /// router instead.
    #[allow(dead_code)]
    pub fn append(&self, msg: &Message) -> Result<(), MailError> {
        match &self.backend {
            Backend::Beads(_) => Err(MailError::Store(StoreError::Constraint(
                "use Router::send for store-backed mail".to_string(),
            ))),
            Backend::Legacy(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| MailError::Store(StoreError::Transport(e.to_string())))?;
                }
                let mut file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .map_err(|e| MailError::Store(StoreError::Transport(e.to_string())))?;
                let line = serde_json::to_string(msg)
                    .map_err(|e| MailError::Store(StoreError::Transport(e.to_string())))?;
                writeln!(file, "{line}")
                    .map_err(|e| MailError::Store(StoreError::Transport(e.to_string())))?;
                Ok(())
            }
        }
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<Message>, MailError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MailError::Store(StoreError::Transport(e.to_string()))),
    };

    let mut messages = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        // Malformed lines are skipped, not fatal.
        if let Ok(msg) = serde_json::from_str::<Message>(line) {
            messages.push(msg);
        }
    }
    Ok(messages)
}

/// Rewrite the whole file through a temp + rename so a concurrent reader
/// never observes a truncated inbox.
fn rewrite_jsonl(path: &Path, messages: &[Message]) -> Result<(), MailError> {
    let mut sorted: Vec<&Message> = messages.iter().collect();
    sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let tmp_path = path.with_extension("jsonl.tmp");
    let mut out = String::new();
    for msg in sorted {
        let line = serde_json::to_string(msg)
            .map_err(|e| MailError::Store(StoreError::Transport(e.to_string())))?;
        out.push_str(&line);
        out.push('\n');
    }

    std::fs::write(&tmp_path, out)
        .map_err(|e| MailError::Store(StoreError::Transport(e.to_string())))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| MailError::Store(StoreError::Transport(e.to_string())))?;
    Ok(())
}
