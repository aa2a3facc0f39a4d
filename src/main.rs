mod address;
mod beads;
mod cli;
mod config;
mod errors;
mod git;
mod mail;
mod protocol;
mod rig;
mod subprocess;
mod tmux;
mod witness;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use address::{IdentityEnv, detect_sender};
use cli::{Cli, Command, MailCommand, WitnessCommand};
use mail::{Mailbox, Message, MessageType, Priority, Router, SearchOptions};
use rig::{Rig, find_town_root};
use witness::WitnessManager;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "gastown=info",
        1 => "gastown=debug",
        _ => "gastown=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let env = IdentityEnv::from_process();
    let cwd = std::env::current_dir()?;

    match cli.command {
        Command::Witness { command } => run_witness(command, &env, &cwd),
        Command::Mail { command } => run_mail(command, &env, &cwd),
    }
}

fn run_witness(
    command: WitnessCommand,
    env: &IdentityEnv,
    cwd: &std::path::Path,
) -> Result<()> {
    let town_root = find_town_root(env, cwd)?;

    match command {
        WitnessCommand::Start {
            rig,
            foreground,
            auto_spawn,
            max_workers,
            epic,
            prefix,
        } => {
            let rig = Rig::load(&town_root, &rig)?;

            // Config overrides land in the state file before the loop
            // starts, so background sessions pick them up too.
            let mut state = witness::WitnessState::load(&rig.path, &rig.name)?;
            if auto_spawn {
                state.config.auto_spawn = true;
            }
            if let Some(max) = max_workers {
                state.config.max_workers = max;
            }
            if epic.is_some() {
                state.config.epic_id = epic;
            }
            if prefix.is_some() {
                state.config.issue_prefix = prefix;
            }
            state.save(&rig.path)?;

            let mut manager = WitnessManager::new(rig, &town_root)?;
            manager.start(foreground)?;
            if !foreground {
                println!("Witness started");
            }
            Ok(())
        }
        WitnessCommand::Stop { rig } => {
            let rig = Rig::load(&town_root, &rig)?;
            let manager = WitnessManager::new(rig, &town_root)?;
            manager.stop()?;
            println!("Witness stopped");
            Ok(())
        }
        WitnessCommand::Status { rig, json } => {
            let rig = Rig::load(&town_root, &rig)?;
            let manager = WitnessManager::new(rig, &town_root)?;
            let state = manager.status()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
                return Ok(());
            }

            println!("Witness for {}: {:?}", state.rig_name, state.state);
            if let Some(started) = state.started_at {
                println!("  started:   {started}");
            }
            if let Some(checked) = state.last_check_at {
                println!("  last tick: {checked}");
            }
            println!("  monitored: {}", state.monitored_polecats.join(", "));
            println!(
                "  checks: {} nudges: {} escalations: {}",
                state.stats.total_checks, state.stats.total_nudges, state.stats.total_escalations
            );
            Ok(())
        }
    }
}

fn run_mail(command: MailCommand, env: &IdentityEnv, cwd: &std::path::Path) -> Result<()> {
    let town_root = find_town_root(env, cwd)?;

    match command {
        MailCommand::Send {
            to,
            subject,
            message,
            priority,
            urgent,
            r#type,
            reply_to,
            cc,
            pinned,
            permanent,
        } => {
            let from = detect_sender(env, cwd);
            let router = Router::new(&town_root)?;

            // Replies join the original's thread when it can be found.
            let thread_id = reply_to.as_ref().and_then(|orig_id| {
                let mailbox = Mailbox::for_address(&from, &town_root);
                mailbox.get(orig_id).ok().and_then(|orig| orig.thread_id)
            });

            let mut msg = Message {
                id: String::new(),
                from,
                to: to.clone(),
                cc,
                subject: subject.clone(),
                body: message,
                timestamp: chrono::Utc::now(),
                read: false,
                priority: if urgent {
                    Priority::Urgent
                } else {
                    Priority::from_beads(priority)
                },
                msg_type: if reply_to.is_some() && r#type == "notification" {
                    MessageType::Reply
                } else {
                    MessageType::parse(&r#type)
                },
                delivery: Default::default(),
                thread_id,
                reply_to,
                pinned,
                wisp: !permanent,
            };

            router.send(&mut msg).context("sending message")?;
            println!("✓ Message sent to {to}");
            println!("  Subject: {subject}");
            Ok(())
        }
        MailCommand::Inbox {
            address,
            unread,
            identity,
            json,
        } => {
            let address = identity
                .or(address)
                .unwrap_or_else(|| detect_sender(env, cwd));
            let mailbox = Mailbox::for_address(&address, &town_root);

            let messages = if unread {
                mailbox.list_unread()?
            } else {
                mailbox.list()?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
                return Ok(());
            }

            let (total, unread_count) = mailbox.count()?;
            println!("Inbox: {address} ({total} messages, {unread_count} unread)");
            for msg in &messages {
                let marker = if msg.read { "○" } else { "●" };
                println!("  {marker} {}", msg.subject);
                println!("    {} from {}", msg.id, msg.from);
            }
            Ok(())
        }
        MailCommand::Read { id, json } => {
            let address = detect_sender(env, cwd);
            let mailbox = Mailbox::for_address(&address, &town_root);
            let msg = mailbox.get(&id).context("getting message")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&msg)?);
                return Ok(());
            }

            println!("Subject: {}", msg.subject);
            println!("From: {}", msg.from);
            println!("To: {}", msg.to);
            println!("Date: {}", msg.timestamp);
            if !msg.body.is_empty() {
                println!("\n{}", msg.body);
            }
            Ok(())
        }
        MailCommand::Thread { id, json } => {
            let address = detect_sender(env, cwd);
            let mailbox = Mailbox::for_address(&address, &town_root);
            let messages = mailbox.list_by_thread(&id)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
                return Ok(());
            }

            println!("Thread: {id} ({} messages)", messages.len());
            for msg in &messages {
                println!("  ● {} from {}", msg.subject, msg.from);
                if !msg.body.is_empty() {
                    println!("    {}", msg.body);
                }
            }
            Ok(())
        }
        MailCommand::Search {
            query,
            from,
            subject,
            body,
            archive,
            json,
        } => {
            let address = detect_sender(env, cwd);
            let mailbox = Mailbox::for_address(&address, &town_root);
            let hits = mailbox.search(&SearchOptions {
                query,
                from,
                subject_only: subject,
                body_only: body,
                include_closed: archive,
            })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
                return Ok(());
            }

            println!("{} match(es)", hits.len());
            for msg in &hits {
                println!("  {} {} from {}", msg.id, msg.subject, msg.from);
            }
            Ok(())
        }
        MailCommand::Claim { queue } => {
            let caller = detect_sender(env, cwd);
            let router = Router::new(&town_root)?;
            match router.claim(&queue, &caller)? {
                Some(msg) => {
                    info!(queue, id = %msg.id, "claimed queue message");
                    println!("✓ Claimed message from queue {queue}");
                    println!("  ID: {}", msg.id);
                    println!("  Subject: {}", msg.subject);
                }
                None => println!("No messages to claim in queue {queue}"),
            }
            Ok(())
        }
        MailCommand::Release { id } => {
            let caller = detect_sender(env, cwd);
            let router = Router::new(&town_root)?;
            router.release(&id, &caller)?;
            println!("✓ Released {id}");
            Ok(())
        }
    }
}
