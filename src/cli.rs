use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "gt",
    about = "Gas Town: multi-agent workspace supervisor",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Witness supervisor lifecycle
    Witness {
        #[command(subcommand)]
        command: WitnessCommand,
    },

    /// Agent messaging
    Mail {
        #[command(subcommand)]
        command: MailCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum WitnessCommand {
    /// Start the witness for a rig
    Start {
        /// Rig name
        rig: String,

        /// Run the patrol loop in this process instead of a tmux session
        #[arg(long)]
        foreground: bool,

        /// Spawn polecats for ready work automatically
        #[arg(long)]
        auto_spawn: bool,

        /// Maximum concurrent polecats
        #[arg(long)]
        max_workers: Option<usize>,

        /// Only auto-spawn issues that block this epic
        #[arg(long)]
        epic: Option<String>,

        /// Only auto-spawn issues with this id prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Stop the witness
    Stop {
        /// Rig name
        rig: String,
    },

    /// Show witness status
    Status {
        /// Rig name
        rig: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum MailCommand {
    /// Send a message
    Send {
        /// Recipient address (e.g. mayor/, gastown/Toast, list:oncall)
        to: String,

        /// Message subject
        #[arg(short, long)]
        subject: String,

        /// Message body
        #[arg(short, long, default_value = "")]
        message: String,

        /// Priority (0=urgent, 1=high, 2=normal, 3=low)
        #[arg(long, default_value = "2")]
        priority: i64,

        /// Shortcut for --priority 0
        #[arg(long)]
        urgent: bool,

        /// Message type (task, scavenge, notification, reply)
        #[arg(long, default_value = "notification")]
        r#type: String,

        /// Message id this replies to
        #[arg(long)]
        reply_to: Option<String>,

        /// CC recipients (repeatable)
        #[arg(long)]
        cc: Vec<String>,

        /// Pin the message so it survives archiving
        #[arg(long)]
        pinned: bool,

        /// Store permanently instead of as an ephemeral wisp
        #[arg(long)]
        permanent: bool,
    },

    /// Show an inbox
    Inbox {
        /// Address (defaults to the detected sender)
        address: Option<String>,

        /// Only unread messages
        #[arg(short, long)]
        unread: bool,

        /// Explicit identity override
        #[arg(long)]
        identity: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read one message
    Read {
        /// Message id
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// View a conversation thread
    Thread {
        /// Thread id
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Search messages by content
    Search {
        /// Regex pattern (case-insensitive)
        query: String,

        /// Filter by sender address substring
        #[arg(long)]
        from: Option<String>,

        /// Only search subject lines
        #[arg(long)]
        subject: bool,

        /// Only search message bodies
        #[arg(long)]
        body: bool,

        /// Include read (archived) messages
        #[arg(long)]
        archive: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Claim the oldest message from a work queue
    Claim {
        /// Queue name
        queue: String,
    },

    /// Release a claimed queue message
    Release {
        /// Message id
        id: String,
    },
}
