//! The patrol scheduler: one witness, one rig, one single-threaded loop.
//!
//! A tick runs five phases in a fixed order: health check (with stuck
//! escalation), mailbox drain with protocol dispatch, the
//! pending-completion watchdog, and capacity-governed auto-spawn. Phases
//! never panic the loop; subprocess failures are logged and the work is
//! retried on the next tick. The 30-second cadence is policy, not a
//! guarantee — ticks never overlap because there is only one thread.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::beads::{BeadsClient, CreateSpec, ListFilter, UpdatePatch};
use crate::config::MessagingConfig;
use crate::errors::{CleanupError, StoreError, WitnessError};
use crate::git::GitDriver;
use crate::mail::{Mailbox, Message, MessageType, Priority, Router};
use crate::protocol::{self, HelpPayload, ProtocolEvent, format_rfc3339};
use crate::rig::Rig;
use crate::subprocess::{CommandRunner, ShellCommandRunner};
use crate::tmux::TmuxDriver;

use super::cleanup::Cleaner;
use super::handoff::{HandoffState, HandoffStore};
use super::state::{RunState, WitnessState};

/// No file activity for this long means a worker is stuck. Exactly at the
/// threshold counts as stuck.
pub const STUCK_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// How long to wait for a worker to send POLECAT_DONE after its issue
/// closed before cleanup runs anyway.
pub const PENDING_COMPLETION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Inter-tick sleep.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

const DEFAULT_REMOTE: &str = "origin";

pub struct WitnessManager<R: CommandRunner + Clone = ShellCommandRunner> {
    rig: Rig,
    town_root: PathBuf,
    runner: R,
    beads: BeadsClient<R>,
    git: GitDriver<R>,
    tmux: TmuxDriver<R>,
    handoff_store: HandoffStore<R>,
    handoff: HandoffState,
    router: Router<R>,
    remote: String,
}

impl WitnessManager<ShellCommandRunner> {
    pub fn new(rig: Rig, town_root: &Path) -> Result<Self> {
        let messaging = MessagingConfig::load(town_root)?;
        Ok(Self::with_runner(
            rig,
            town_root,
            ShellCommandRunner,
            messaging,
        ))
    }
}

impl<R: CommandRunner + Clone> WitnessManager<R> {
    pub fn with_runner(
        rig: Rig,
        town_root: &Path,
        runner: R,
        messaging: MessagingConfig,
    ) -> Self {
        let beads_dir = town_root.join(".beads");
        let client = |r: R| BeadsClient::with_runner(town_root, r).with_beads_dir(&beads_dir);

        let beads = client(runner.clone());
        let handoff_store = HandoffStore::new(client(runner.clone()), &rig.name);
        let router = Router::with_client(town_root, client(runner.clone()), messaging);

        Self {
            git: GitDriver::with_runner(runner.clone()),
            tmux: TmuxDriver::with_runner(runner.clone()),
            beads,
            handoff_store,
            handoff: HandoffState::default(),
            router,
            remote: DEFAULT_REMOTE.to_string(),
            town_root: town_root.to_path_buf(),
            runner,
            rig,
        }
    }

    fn witness_address(&self) -> String {
        format!("{}/witness", self.rig.name)
    }

    fn witness_session(&self) -> String {
        self.rig.session_name("witness")
    }

    // ---- lifecycle ----------------------------------------------------

    /// Current status, reconciled against the live session.
    pub fn status(&self) -> Result<WitnessState> {
        let mut state = WitnessState::load(&self.rig.path, &self.rig.name)?;

        if state.state == RunState::Running && !self.tmux.has_session(&self.witness_session())? {
            state.state = RunState::Stopped;
            state.started_at = None;
            state.save(&self.rig.path)?;
        }

        state.monitored_polecats = self.rig.polecats()?;
        Ok(state)
    }

    /// Start the witness. Foreground blocks in the patrol loop; background
    /// hosts the loop inside a fresh tmux session.
    pub fn start(&mut self, foreground: bool) -> Result<()> {
        let mut state = WitnessState::load(&self.rig.path, &self.rig.name)?;

        let session = self.witness_session();
        if self.tmux.has_session(&session)? {
            if self.tmux.agent_alive(&session) {
                return Err(WitnessError::AlreadyRunning.into());
            }
            // Stale session with a dead agent: replace it.
            info!(session, "replacing dead witness session");
            self.tmux.kill_session(&session)?;
        } else if state.state == RunState::Running && foreground {
            // State file says running but no session backs it; fall through
            // and take over.
            debug!("state file claims running without a session, taking over");
        }

        state.state = RunState::Running;
        state.started_at = Some(Utc::now());
        state.monitored_polecats = self.rig.polecats()?;
        state.save(&self.rig.path)?;

        if foreground {
            return self.run(state);
        }

        self.tmux.new_session(&session, &self.rig.path)?;
        self.tmux.set_environment(&session, "GT_ROLE", "witness")?;
        self.tmux.set_environment(&session, "GT_RIG", &self.rig.name)?;
        self.tmux.send_keys(
            &session,
            &format!("gt witness start {} --foreground", self.rig.name),
        )?;
        Ok(())
    }

    /// Stop the witness: kill the session, mark stopped. A foreground loop
    /// observes the state flip and exits between ticks.
    pub fn stop(&self) -> Result<()> {
        let mut state = WitnessState::load(&self.rig.path, &self.rig.name)?;
        if state.state != RunState::Running {
            return Err(WitnessError::NotRunning.into());
        }

        self.tmux.kill_session(&self.witness_session())?;

        state.state = RunState::Stopped;
        state.started_at = None;
        state.save(&self.rig.path)?;
        Ok(())
    }

    /// The patrol loop: immediate first tick, then one tick per interval.
    fn run(&mut self, mut state: WitnessState) -> Result<()> {
        self.handoff = match self.handoff_store.load() {
            Ok(handoff) => handoff,
            Err(e) => {
                warn!(error = %e, "could not load handoff state, starting empty");
                HandoffState::default()
            }
        };
        info!(
            rig = %self.rig.name,
            workers = self.handoff.worker_states.len(),
            "witness patrol starting"
        );

        if let Err(e) = self.ensure_patrol_instance() {
            warn!(error = %e, "could not ensure patrol instance");
        }

        loop {
            self.tick(&mut state, Utc::now());
            std::thread::sleep(TICK_INTERVAL);

            // Reload to observe an external `gt witness stop`.
            match WitnessState::load(&self.rig.path, &self.rig.name) {
                Ok(current) if current.state == RunState::Stopped => {
                    info!("stop requested, exiting patrol loop");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "could not reload state"),
            }
        }
    }

    /// One patrol tick. Phases run in order and never abort the tick.
    fn tick(&mut self, state: &mut WitnessState, now: DateTime<Utc>) {
        state.roll_day(now);

        if let Err(e) = self.health_check(state, now) {
            warn!(error = %e, "health check failed");
        }
        if let Err(e) = self.drain_mailbox(state, now) {
            warn!(error = %e, "mailbox drain failed");
        }
        if let Err(e) = self.check_pending_completions(state, now) {
            warn!(error = %e, "pending completion check failed");
        }
        if state.config.auto_spawn {
            if let Err(e) = self.auto_spawn(state) {
                warn!(error = %e, "auto-spawn failed");
            }
        }

        self.handoff.last_patrol = Some(now);
        if let Err(e) = self.handoff_store.save(&self.handoff) {
            warn!(error = %e, "could not persist handoff state");
        }
    }

    // ---- phase (a)+(b): health check and stuck escalation --------------

    fn health_check(&mut self, state: &mut WitnessState, now: DateTime<Utc>) -> Result<()> {
        state.last_check_at = Some(now);
        state.stats.total_checks += 1;
        state.stats.today_checks += 1;

        let mut active = Vec::new();
        for name in self.rig.polecats()? {
            let session = self.rig.session_name(&name);
            if !self.tmux.has_session(&session).unwrap_or(false) {
                continue;
            }
            active.push(name.clone());

            if let Err(e) = self.ensure_polecat_arm(&name) {
                warn!(polecat = %name, error = %e, "could not ensure arm");
            }

            let latest = latest_activity(&self.rig.polecat_path(&name));
            if is_stuck(latest, now) {
                self.handle_stuck(state, &name, now);
            } else {
                self.handoff.update_activity(&name, None, now);
            }
        }

        state.monitored_polecats = active;
        state.save(&self.rig.path)
    }

    fn handle_stuck(&mut self, state: &mut WitnessState, name: &str, now: DateTime<Utc>) {
        let count = self.handoff.nudge_count(name);
        info!(polecat = name, nudges = count, "polecat appears stuck");

        if count == 0 {
            if let Err(e) = self.send_nudge(name, "No activity detected. Are you still working?") {
                warn!(polecat = name, error = %e, "failed to send nudge");
            }
            self.handoff.record_nudge(name, now);
            self.persist_handoff();
            state.record_nudge_tag(name);
            state.stats.total_nudges += 1;
            state.stats.today_nudges += 1;
        } else if count == 1 {
            if let Err(e) = self.escalate_stuck(name, now) {
                warn!(polecat = name, error = %e, "failed to escalate");
            }
            self.handoff.record_nudge(name, now);
            self.persist_handoff();
            state.record_nudge_tag(name);
            state.stats.total_escalations += 1;
        } else {
            info!(polecat = name, "still stuck, waiting for human intervention");
        }
    }

    fn send_nudge(&self, name: &str, reason: &str) -> Result<()> {
        let body = format!(
            "{reason}\n\nPlease fix the issue and run 'gt handoff' again.\n\n\
             Polecat: {name}\nRig: {rig}\nTime: {time}",
            rig = self.rig.name,
            time = format_rfc3339(Utc::now()),
        );
        let mut msg = self.message(
            &format!("{}/{}", self.rig.name, name),
            &format!("NUDGE: {reason}"),
            &body,
            Priority::Normal,
        );
        self.router.send(&mut msg)?;
        Ok(())
    }

    fn escalate_stuck(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let threshold_min = STUCK_THRESHOLD.as_secs() / 60;
        let body = format!(
            "Polecat {name} in rig {rig} appears stuck.\n\n\
             This polecat has been unresponsive for over {mins} minutes despite nudging.\n\n\
             Recommended actions:\n\
             1. Check 'gt session attach {rig}/{name}' to see current state\n\
             2. If truly stuck, run 'gt session stop {rig}/{name}' to kill the session\n\
             3. Investigate root cause\n\n\
             Rig: {rig}\nTime: {time}",
            rig = self.rig.name,
            mins = threshold_min * 2,
            time = format_rfc3339(now),
        );
        let mut msg = self.message(
            "mayor/",
            &format!("ESCALATION: Polecat {name} stuck"),
            &body,
            Priority::Normal,
        );
        self.router.send(&mut msg)?;
        Ok(())
    }

    fn message(&self, to: &str, subject: &str, body: &str, priority: Priority) -> Message {
        Message {
            id: String::new(),
            from: self.witness_address(),
            to: to.to_string(),
            cc: Vec::new(),
            subject: subject.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
            read: false,
            priority,
            msg_type: MessageType::Notification,
            delivery: Default::default(),
            thread_id: None,
            reply_to: None,
            pinned: false,
            wisp: true,
        }
    }

    fn persist_handoff(&self) {
        if let Err(e) = self.handoff_store.save(&self.handoff) {
            warn!(error = %e, "failed to persist handoff state");
        }
    }

    // ---- phase (c): mailbox drain and protocol dispatch ----------------

    fn drain_mailbox(&mut self, state: &mut WitnessState, now: DateTime<Utc>) -> Result<()> {
        let mailbox = Mailbox::with_client(
            &self.witness_address(),
            BeadsClient::with_runner(&self.town_root, self.runner.clone())
                .with_beads_dir(self.town_root.join(".beads")),
        );

        let messages = mailbox.list_unread().context("listing witness mailbox")?;
        for msg in messages {
            match protocol::decode(&msg.subject, &msg.body) {
                // Decode failures stay unacknowledged so a human sees the
                // same message again next tick.
                Err(e) => warn!(id = %msg.id, error = %e, "undecodable protocol message"),
                Ok(None) => debug!(id = %msg.id, "non-protocol mail, leaving for agent"),
                Ok(Some(event)) => self.dispatch(state, &mailbox, &msg, event, now),
            }
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        state: &mut WitnessState,
        mailbox: &Mailbox<R>,
        msg: &Message,
        event: ProtocolEvent,
        now: DateTime<Utc>,
    ) {
        info!(id = %msg.id, kind = event.kind(), "dispatching protocol message");
        match event {
            ProtocolEvent::PolecatDone(payload) => {
                let name = payload.polecat_name.clone();
                state.record_done(&name);
                if let Err(e) = state.save(&self.rig.path) {
                    warn!(error = %e, "failed to save state");
                }
                if let Some(issue) = &payload.issue_id {
                    self.handoff.update_activity(&name, Some(issue), now);
                }

                let wisp = match self.ensure_cleanup_wisp(
                    &name,
                    payload.issue_id.as_deref(),
                    payload.branch.as_deref(),
                ) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(polecat = %name, error = %e, "could not track cleanup");
                        None
                    }
                };

                if self.try_cleanup(state, &name) {
                    if let Some(wisp_id) = wisp {
                        let _ = self.beads.close(&wisp_id, Some("polecat cleaned"));
                    }
                    self.ack(mailbox, &msg.id);
                }
            }
            ProtocolEvent::LifecycleShutdown(payload) => {
                let name = payload.polecat_name;
                if !state.has_done(&name) {
                    info!(polecat = %name, "shutdown before POLECAT_DONE, nudging");
                    if let Err(e) =
                        self.send_nudge(&name, "Please run 'gt done' to signal completion")
                    {
                        warn!(error = %e, "failed to send nudge");
                    }
                    return; // unacknowledged, retried next tick
                }
                if self.try_cleanup(state, &name) {
                    self.ack(mailbox, &msg.id);
                }
            }
            ProtocolEvent::Help(payload) => {
                let assessment = assess_help(&payload);
                if assessment.can_help {
                    info!(
                        agent = %payload.agent,
                        topic = %payload.topic,
                        action = %assessment.action,
                        "help request handled"
                    );
                    self.ack(mailbox, &msg.id);
                } else {
                    match self.escalate_help(&payload, &assessment.action) {
                        Ok(()) => self.ack(mailbox, &msg.id),
                        Err(e) => warn!(error = %e, "failed to escalate help request"),
                    }
                }
            }
            ProtocolEvent::Merged(payload) => {
                let name = payload.polecat_name;
                match self.find_cleanup_wisp(&name) {
                    Ok(Some(wisp_id)) => {
                        let patch = UpdatePatch {
                            labels: Some(cleanup_wisp_labels(&name, "ready-to-nuke")),
                            ..Default::default()
                        };
                        match self.beads.update(&wisp_id, &patch) {
                            Ok(()) => {
                                info!(polecat = %name, wisp = %wisp_id, "marked ready to nuke");
                                self.ack(mailbox, &msg.id);
                            }
                            Err(e) => warn!(error = %e, "failed to annotate cleanup item"),
                        }
                    }
                    Ok(None) => {
                        info!(polecat = %name, "no cleanup item found, may be already cleaned");
                        self.ack(mailbox, &msg.id);
                    }
                    Err(e) => warn!(error = %e, "failed to look up cleanup item"),
                }
            }
            ProtocolEvent::SwarmStart(payload) => {
                let spec = CreateSpec {
                    title: format!("swarm:{}", payload.swarm_id),
                    description: format!(
                        "Tracking batch: {}\nTotal: {} polecats",
                        payload.swarm_id, payload.total
                    ),
                    labels: swarm_wisp_labels(&payload.swarm_id, payload.total, 0, payload.started_at),
                    ephemeral: true,
                    ..Default::default()
                };
                match self.beads.create(&spec) {
                    Ok(id) => {
                        info!(swarm = %payload.swarm_id, wisp = %id, "swarm tracking started");
                        self.ack(mailbox, &msg.id);
                    }
                    Err(e) => warn!(error = %e, "failed to create swarm tracker"),
                }
            }
        }
    }

    /// Run the cleaner for a worker. Returns true when the driving message
    /// should be acknowledged. Safety aborts turn into a nudge that spells
    /// out exactly what is blocking teardown.
    fn try_cleanup(&mut self, state: &mut WitnessState, name: &str) -> bool {
        let result = {
            let cleaner = Cleaner::new(&self.rig, &self.git, &self.tmux, &self.remote);
            cleaner.cleanup(name)
        };
        match result {
            Ok(()) => {
                self.handoff.prune_worker(name);
                self.persist_handoff();
                state.clear_waiting(name);
                if let Err(e) = state.save(&self.rig.path) {
                    warn!(error = %e, "failed to save state");
                }
                true
            }
            Err(e @ CleanupError::UncommittedWork { .. }) => {
                info!(polecat = name, "refusing cleanup: {e}");
                if let Err(send_err) = self.send_nudge(name, &format!("Cannot shutdown - {e}")) {
                    warn!(error = %send_err, "failed to send nudge");
                }
                false
            }
            Err(CleanupError::Transport(detail)) => {
                warn!(polecat = name, detail = %detail, "cleanup transport failure, will retry");
                false
            }
        }
    }

    fn ack(&self, mailbox: &Mailbox<R>, id: &str) {
        if let Err(e) = mailbox.mark_read(id) {
            warn!(id, error = %e, "failed to acknowledge message");
        }
    }

    fn escalate_help(&self, payload: &HelpPayload, reason: &str) -> Result<()> {
        let body = format!(
            "Agent: {}\nIssue: {}\nTopic: {}\nProblem: {}\nTried: {}\n\
             Escalation reason: {}\nRequested at: {}",
            payload.agent,
            payload.issue_id,
            payload.topic,
            payload.problem,
            payload.tried,
            reason,
            format_rfc3339(payload.requested_at),
        );
        let mut msg = self.message(
            "mayor/",
            &format!("Escalation: {} needs help", payload.agent),
            &body,
            Priority::High,
        );
        self.router.send(&mut msg)?;
        Ok(())
    }

    fn find_cleanup_wisp(&self, name: &str) -> Result<Option<String>, StoreError> {
        let issues = self.beads.list(&ListFilter {
            labels: vec![format!("polecat:{name}")],
            status: Some("open".to_string()),
            wisp_only: true,
            ..Default::default()
        })?;
        Ok(issues.first().map(|i| i.id.clone()))
    }

    fn ensure_cleanup_wisp(
        &self,
        name: &str,
        issue_id: Option<&str>,
        branch: Option<&str>,
    ) -> Result<String, StoreError> {
        if let Some(existing) = self.find_cleanup_wisp(name)? {
            return Ok(existing);
        }

        let mut description = format!("Verify and cleanup polecat {name}");
        if let Some(issue) = issue_id {
            description.push_str(&format!("\nIssue: {issue}"));
        }
        if let Some(branch) = branch {
            description.push_str(&format!("\nBranch: {branch}"));
        }

        self.beads.create(&CreateSpec {
            title: format!("cleanup:{name}"),
            description,
            labels: cleanup_wisp_labels(name, "pending"),
            ephemeral: true,
            ..Default::default()
        })
    }

    // ---- phase (d): pending-completion watchdog ------------------------

    fn check_pending_completions(
        &mut self,
        state: &mut WitnessState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for name in self.rig.polecats()? {
            let session = self.rig.session_name(&name);
            if !self.tmux.has_session(&session).unwrap_or(false) {
                continue;
            }
            if state.has_done(&name) {
                continue;
            }

            let Some(issue_id) = read_polecat_issue(&self.rig.polecat_path(&name)) else {
                continue;
            };
            if !self.is_issue_closed(&issue_id).unwrap_or(false) {
                continue;
            }

            match state.waiting_since(&name) {
                None => {
                    info!(polecat = %name, issue = %issue_id, "issue closed without POLECAT_DONE");
                    state.record_waiting(&name, now);
                    if let Err(e) = state.save(&self.rig.path) {
                        warn!(error = %e, "failed to save state");
                    }
                    if let Err(e) = self.send_nudge(
                        &name,
                        "Your issue is closed. Please run 'gt done' to complete shutdown.",
                    ) {
                        warn!(error = %e, "failed to send nudge");
                    }
                }
                Some(since) => {
                    let elapsed = now.signed_duration_since(since);
                    let timeout = TimeDelta::from_std(PENDING_COMPLETION_TIMEOUT)
                        .unwrap_or_else(|_| TimeDelta::minutes(10));
                    if elapsed >= timeout {
                        info!(polecat = %name, "timeout waiting for POLECAT_DONE, cleaning up");
                        self.force_cleanup_after_timeout(state, &name, now);
                    } else {
                        debug!(
                            polecat = %name,
                            elapsed_secs = elapsed.num_seconds(),
                            "still waiting for POLECAT_DONE"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn force_cleanup_after_timeout(
        &mut self,
        state: &mut WitnessState,
        name: &str,
        now: DateTime<Utc>,
    ) {
        let result = {
            let cleaner = Cleaner::new(&self.rig, &self.git, &self.tmux, &self.remote);
            cleaner.cleanup(name)
        };
        match result {
            Ok(()) => {
                state.clear_waiting(name);
                self.handoff.prune_worker(name);
                self.persist_handoff();
                if let Err(e) = state.save(&self.rig.path) {
                    warn!(error = %e, "failed to save state");
                }
            }
            Err(e @ CleanupError::UncommittedWork { .. }) => {
                // The waiting tag stays; the mayor decides what to do.
                warn!(polecat = name, "cannot force cleanup: {e}");
                if let Err(esc) = self.escalate_stuck(name, now) {
                    warn!(error = %esc, "failed to escalate blocked cleanup");
                }
            }
            Err(CleanupError::Transport(detail)) => {
                warn!(polecat = name, detail = %detail, "force cleanup transport failure");
            }
        }
    }

    fn is_issue_closed(&self, issue_id: &str) -> Result<bool, StoreError> {
        match self.beads.show(&[issue_id]) {
            Ok(issues) => Ok(issues[0].status == "closed"),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ---- phase (e): auto-spawn ----------------------------------------

    fn auto_spawn(&mut self, state: &mut WitnessState) -> Result<()> {
        let active_count = self.active_polecat_count()?;
        let max_workers = if state.config.max_workers == 0 {
            4
        } else {
            state.config.max_workers
        };
        if active_count >= max_workers {
            return Ok(());
        }

        let ready = self.beads.ready().context("fetching ready work")?;

        let mut spawnable = Vec::new();
        for issue in ready {
            if issue.issue_type == "merge-request" || issue.issue_type == "epic" {
                continue;
            }
            if state.is_spawned(&issue.id) {
                continue;
            }
            if let Some(epic) = &state.config.epic_id {
                // Unknown parentage is excluded rather than guessed at.
                if !self.blocks_epic(&issue.id, epic).unwrap_or(false) {
                    continue;
                }
            }
            if let Some(prefix) = &state.config.issue_prefix
                && !issue.id.starts_with(prefix.as_str())
            {
                continue;
            }
            spawnable.push(issue);
        }

        let mut spawned = 0usize;
        for issue in &spawnable {
            if active_count + spawned >= max_workers {
                break;
            }
            if spawned > 0 && state.config.spawn_delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(state.config.spawn_delay_ms));
            }

            info!(issue = %issue.id, title = %issue.title, "auto-spawning polecat");
            match self.spawn_polecat(&issue.id) {
                Ok(()) => {
                    state.record_spawned(&issue.id);
                    spawned += 1;
                }
                Err(e) => warn!(issue = %issue.id, error = %e, "spawn failed"),
            }
        }

        if spawned > 0 {
            state.save(&self.rig.path)?;
        }
        Ok(())
    }

    fn active_polecat_count(&self) -> Result<usize> {
        let mut count = 0;
        for name in self.rig.polecats()? {
            if self
                .tmux
                .has_session(&self.rig.session_name(&name))
                .unwrap_or(false)
            {
                count += 1;
            }
        }
        Ok(count)
    }

    fn blocks_epic(&self, issue_id: &str, epic_id: &str) -> Result<bool, StoreError> {
        let issues = self.beads.show(&[issue_id])?;
        Ok(issues[0]
            .dependents
            .iter()
            .any(|d| d.id == epic_id && d.dependency_type == "blocks"))
    }

    fn spawn_polecat(&self, issue_id: &str) -> Result<()> {
        let args: Vec<String> = [
            "spawn",
            "--rig",
            self.rig.name.as_str(),
            "--issue",
            issue_id,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let result = self.runner.run("gt", &args, &self.town_root, &[])?;
        if !result.status_success {
            bail!("gt spawn: {}", result.stderr.trim());
        }
        Ok(())
    }

    // ---- patrol instance and arms -------------------------------------

    /// Ensure the patrol root issue exists, reusing one from a previous
    /// session when it still does.
    fn ensure_patrol_instance(&mut self) -> Result<(), StoreError> {
        if let Some(id) = self.handoff.patrol_instance_id.clone() {
            if self.beads.exists(&id)? {
                debug!(patrol = %id, "reusing patrol instance");
                return Ok(());
            }
            self.handoff.patrol_instance_id = None;
        }

        let id = self.beads.create(&CreateSpec {
            issue_type: Some("task".to_string()),
            title: format!("Witness Patrol ({})", self.rig.name),
            description: format!(
                "Active patrol instance for {rig}.\n\nrig: {rig}\nstarted_at: {time}\ntype: patrol-instance",
                rig = self.rig.name,
                time = format_rfc3339(Utc::now()),
            ),
            priority: Some(3),
            ..Default::default()
        })?;

        info!(patrol = %id, "created patrol instance");
        self.handoff.patrol_instance_id = Some(id);
        self.handoff_store.save(&self.handoff)?;
        Ok(())
    }

    /// Ensure a tracking arm is bonded to the patrol instance for a
    /// worker. Arms are plain issues linked by labels; traversal is by id.
    fn ensure_polecat_arm(&mut self, name: &str) -> Result<(), StoreError> {
        let Some(patrol_id) = self.handoff.patrol_instance_id.clone() else {
            return Ok(());
        };

        if let Some(arm_id) = self
            .handoff
            .worker_states
            .get(name)
            .and_then(|ws| ws.arm_id.clone())
        {
            if self.beads.exists(&arm_id)? {
                return Ok(());
            }
            if let Some(ws) = self.handoff.worker_states.get_mut(name) {
                ws.arm_id = None;
            }
        }

        let arm_id = self.beads.create(&CreateSpec {
            issue_type: Some("task".to_string()),
            title: format!("arm-{name}"),
            description: format!(
                "Patrol arm for polecat {name}.\n\npolecat_name: {name}\nrig: {}",
                self.rig.name
            ),
            labels: vec![format!("patrol:{patrol_id}"), format!("polecat:{name}")],
            priority: Some(4),
            ..Default::default()
        })?;

        info!(polecat = name, arm = %arm_id, "bonded patrol arm");
        self.handoff
            .worker_states
            .entry(name.to_string())
            .or_default()
            .arm_id = Some(arm_id);
        self.handoff_store.save(&self.handoff)?;
        Ok(())
    }
}

// ---- pure helpers ------------------------------------------------------

/// Most recent activity timestamp for a worktree: the `.git` directory,
/// the runtime state file, or the freshest of a few canonical files.
fn latest_activity(worktree: &Path) -> Option<DateTime<Utc>> {
    let candidates = [
        worktree.join(".git"),
        worktree.join(".runtime").join("state.json"),
        worktree.join(".git").join("logs").join("HEAD"),
        worktree.join(".git").join("index"),
        worktree.join(".beads").join("issues.jsonl"),
    ];

    let mut latest: Option<DateTime<Utc>> = None;
    for path in candidates {
        if let Ok(meta) = std::fs::metadata(&path)
            && let Ok(mtime) = meta.modified()
        {
            let ts: DateTime<Utc> = mtime.into();
            if latest.is_none_or(|prev| ts > prev) {
                latest = Some(ts);
            }
        }
    }
    latest
}

/// Exactly at the threshold is stuck; strictly inside the window is
/// healthy. No observable activity at all is stuck.
fn is_stuck(latest: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let threshold = TimeDelta::from_std(STUCK_THRESHOLD).unwrap_or_else(|_| TimeDelta::minutes(30));
    match latest {
        None => true,
        Some(ts) => now.signed_duration_since(ts) >= threshold,
    }
}

/// Which issue a polecat is working on, from its runtime state file.
fn read_polecat_issue(worktree: &Path) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct RuntimeState {
        #[serde(default)]
        issue_id: String,
    }

    let path = worktree.join(".runtime").join("state.json");
    let data = std::fs::read_to_string(path).ok()?;
    let state: RuntimeState = serde_json::from_str(&data).ok()?;
    if state.issue_id.is_empty() {
        None
    } else {
        Some(state.issue_id)
    }
}

fn cleanup_wisp_labels(name: &str, state: &str) -> Vec<String> {
    vec![format!("polecat:{name}"), format!("state:{state}")]
}

fn swarm_wisp_labels(
    swarm_id: &str,
    total: usize,
    done: usize,
    started_at: DateTime<Utc>,
) -> Vec<String> {
    vec![
        format!("swarm:{swarm_id}"),
        format!("total:{total}"),
        format!("done:{done}"),
        format!("started:{}", format_rfc3339(started_at)),
    ]
}

struct HelpAssessment {
    can_help: bool,
    action: String,
}

/// Triage a HELP request. The witness can help with rig mechanics it owns
/// (sessions, mail, nudges); everything else goes to the mayor.
fn assess_help(payload: &HelpPayload) -> HelpAssessment {
    const ASSISTABLE: &[&str] = &["mail", "inbox", "session", "tmux", "nudge", "worktree"];

    let topic = payload.topic.to_lowercase();
    if ASSISTABLE.iter().any(|kw| topic.contains(kw)) {
        HelpAssessment {
            can_help: true,
            action: format!("witness can assist with '{}'", payload.topic),
        }
    } else {
        HelpAssessment {
            can_help: false,
            action: format!("topic '{}' is outside witness scope", payload.topic),
        }
    }
}
