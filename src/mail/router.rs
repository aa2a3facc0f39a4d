//! Message routing: address validation, fan-out, and queue claims.
//!
//! The router is the only writer of message issues. It translates the
//! envelope into store fields (priority integer, metadata labels) and
//! enforces queue semantics: claim promotes a queue message to the caller,
//! release hands it back after verifying the caller actually claimed it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::address::{address_to_identity, match_worker_pattern};
use crate::beads::{BeadsClient, CreateSpec, ListFilter, UpdatePatch};
use crate::config::MessagingConfig;
use crate::errors::{MailError, StoreError};
use crate::subprocess::{CommandRunner, ShellCommandRunner};

use super::Message;

static THREAD_COUNTER: AtomicU64 = AtomicU64::new(1);

/// New thread ids only need to be unique within one town.
fn generate_thread_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let seq = THREAD_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("thread-{:x}-{:x}", nanos ^ ((std::process::id() as u64) << 32), seq)
}

pub struct Router<R: CommandRunner = ShellCommandRunner> {
    town_root: PathBuf,
    client: BeadsClient<R>,
    config: MessagingConfig,
}

impl Router<ShellCommandRunner> {
    pub fn new(town_root: &Path) -> anyhow::Result<Self> {
        let config = MessagingConfig::load(town_root)?;
        let client = BeadsClient::new(town_root).with_beads_dir(town_root.join(".beads"));
        Ok(Self {
            town_root: town_root.to_path_buf(),
            client,
            config,
        })
    }
}

impl<R: CommandRunner> Router<R> {
    pub fn with_client(town_root: &Path, client: BeadsClient<R>, config: MessagingConfig) -> Self {
        Self {
            town_root: town_root.to_path_buf(),
            client,
            config,
        }
    }

    #[allow(dead_code)]
    pub fn town_root(&self) -> &Path {
        &self.town_root
    }

    /// Send a message. On success `msg.id` and `msg.thread_id` are filled
    /// in; list addresses fan out one copy per member and the id of the
    /// first copy is reported.
    pub fn send(&self, msg: &mut Message) -> Result<(), MailError> {
        validate_address(&msg.to)?;

        if msg.thread_id.is_none() {
            msg.thread_id = Some(generate_thread_id());
        }

        let mut recipients = self.expand_recipients(&msg.to)?;
        for cc in &msg.cc {
            validate_address(cc)?;
            recipients.push(cc.clone());
        }

        let mut first_id = None;
        for recipient in recipients {
            let id = self.create_copy(msg, &recipient)?;
            if first_id.is_none() {
                first_id = Some(id);
            }
        }

        if let Some(id) = first_id {
            msg.id = id;
        }
        info!(to = %msg.to, subject = %msg.subject, "mail sent");
        Ok(())
    }

    fn expand_recipients(&self, to: &str) -> Result<Vec<String>, MailError> {
        if let Some(list) = to.strip_prefix("list:") {
            let members = self
                .config
                .lists
                .get(list)
                .ok_or_else(|| MailError::InvalidAddress(format!("unknown list: {list}")))?;
            if members.is_empty() {
                return Err(MailError::InvalidAddress(format!("empty list: {list}")));
            }
            return Ok(members.clone());
        }
        Ok(vec![to.to_string()])
    }

    fn create_copy(&self, msg: &Message, recipient: &str) -> Result<String, MailError> {
        let assignee = if recipient.starts_with("queue:") {
            recipient.to_string()
        } else {
            address_to_identity(recipient)
        };

        let mut labels = vec![
            format!("from:{}", address_to_identity(&msg.from)),
            format!("msg-type:{}", msg.msg_type.as_str()),
        ];
        if let Some(thread) = &msg.thread_id {
            labels.push(format!("thread:{thread}"));
        }
        if let Some(reply_to) = &msg.reply_to {
            labels.push(format!("reply-to:{reply_to}"));
        }
        if let Some(channel) = recipient.strip_prefix("announce:") {
            labels.push(format!("announce_channel:{channel}"));
        }
        if let Some(queue) = recipient.strip_prefix("queue:") {
            labels.push(format!("queue:{queue}"));
        }

        let id = self.client.create(&CreateSpec {
            issue_type: Some("message".to_string()),
            title: msg.subject.clone(),
            description: msg.body.clone(),
            labels,
            priority: Some(msg.priority.to_beads()),
            assignee: Some(assignee),
            ephemeral: msg.wisp,
            ..Default::default()
        })?;

        if msg.pinned {
            // Best effort: not every store build supports pinning.
            let _ = self.client.update(
                &id,
                &UpdatePatch {
                    pinned: Some(true),
                    ..Default::default()
                },
            );
        }

        Ok(id)
    }

    /// Claim the oldest unclaimed message from a work queue. Returns
    /// `Ok(None)` when the queue is empty.
    pub fn claim(&self, queue: &str, caller: &str) -> Result<Option<Message>, MailError> {
        let queue_cfg = self
            .config
            .queues
            .get(queue)
            .ok_or_else(|| MailError::InvalidAddress(format!("unknown queue: {queue}")))?;

        // Patterns are written against either form ("rig/polecats/*" or
        // "rig/*"), so match the caller both as given and canonicalized.
        let caller_identity = address_to_identity(caller);
        let eligible = queue_cfg.workers.iter().any(|pattern| {
            match_worker_pattern(pattern, caller) || match_worker_pattern(pattern, &caller_identity)
        });
        if !eligible {
            return Err(MailError::NotEligible {
                caller: caller_identity,
                queue: queue.to_string(),
            });
        }

        let issues = self.client.list(&ListFilter {
            issue_type: Some("message".to_string()),
            assignee: Some(format!("queue:{queue}")),
            status: Some("open".to_string()),
            sort: Some("created".to_string()),
            limit: Some(0),
            ..Default::default()
        })?;

        let Some(oldest) = issues.first() else {
            return Ok(None);
        };

        self.client.update(
            &oldest.id,
            &UpdatePatch {
                assignee: Some(caller_identity),
                status: Some("in_progress".to_string()),
                ..Default::default()
            },
        )?;

        Ok(Some(Message::from_issue(oldest)))
    }

    /// Release a claimed message back to its queue.
    pub fn release(&self, id: &str, caller: &str) -> Result<(), MailError> {
        let issues = match self.client.show(&[id]) {
            Ok(issues) => issues,
            Err(StoreError::NotFound) => return Err(MailError::MessageNotFound),
            Err(e) => return Err(e.into()),
        };
        let issue = &issues[0];

        let caller_identity = address_to_identity(caller);
        if issue.assignee != caller_identity {
            return Err(MailError::NotClaimedByCaller);
        }

        let queue = issue
            .labels
            .iter()
            .find_map(|l| l.strip_prefix("queue:"))
            .ok_or(MailError::NotClaimedByCaller)?;

        self.client.update(
            id,
            &UpdatePatch {
                assignee: Some(format!("queue:{queue}")),
                status: Some("open".to_string()),
                ..Default::default()
            },
        )?;
        Ok(())
    }
}

fn validate_address(address: &str) -> Result<(), MailError> {
    let ok = !address.is_empty()
        && !address.contains(char::is_whitespace)
        && (address.contains('/')
            || address.starts_with("list:")
            || address.starts_with("queue:")
            || address.starts_with("announce:")
            || address == "overseer"
            || address == "mayor"
            || address == "deacon");
    if ok {
        Ok(())
    } else {
        Err(MailError::InvalidAddress(address.to_string()))
    }
}
