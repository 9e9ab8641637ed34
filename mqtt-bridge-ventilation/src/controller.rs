//! The control loop.
//!
//! [`Controller`] owns all process state and is driven from a single task:
//! every tick it advances the connectivity supervisor and runs an automatic
//! read when one is due; console lines and session events are handled as they
//! arrive.

use std::io::Write;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::command::{
    Command, Console, INTERVAL_PROMPT, PollingPolicy, StatusLine, UNKNOWN_REPLY, menu,
};
use crate::error::{CommandError, PublishError};
use crate::publisher::{MessageSink, PublishOutcome, Publisher};
use crate::reader::{RegisterBus, RegisterReader};
use crate::session::SessionEvent;
use crate::snapshot::{MonotonicClock, SensorSnapshot, SnapshotBuilder};
use crate::supervisor::{ConnectionState, Supervisor};

/// Text written back to the operator console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A complete line
    Line(String),
    /// A prompt, left open for input
    Prompt(&'static str),
}

impl Reply {
    /// Write the reply to `out`.
    pub fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        match self {
            Reply::Line(text) => writeln!(out, "{}", text)?,
            Reply::Prompt(text) => write!(out, "{}", text)?,
        }
        out.flush()
    }
}

/// Owns the bridge state and runs the control loop.
pub struct Controller<B, S> {
    reader: RegisterReader<B>,
    builder: SnapshotBuilder,
    publisher: Publisher<S>,
    supervisor: Supervisor,
    policy: PollingPolicy,
    console: Console,
    clock: MonotonicClock,
    snapshot: SensorSnapshot,
    last_auto_read: u64,
}

impl<B: RegisterBus, S: MessageSink> Controller<B, S> {
    pub fn new(
        reader: RegisterReader<B>,
        builder: SnapshotBuilder,
        publisher: Publisher<S>,
        supervisor: Supervisor,
        policy: PollingPolicy,
    ) -> Self {
        Self {
            reader,
            builder,
            publisher,
            supervisor,
            policy,
            console: Console::new(),
            clock: MonotonicClock::start(),
            snapshot: SensorSnapshot::default(),
            last_auto_read: 0,
        }
    }

    /// Most recent snapshot.
    pub fn snapshot(&self) -> &SensorSnapshot {
        &self.snapshot
    }

    pub fn policy(&self) -> &PollingPolicy {
        &self.policy
    }

    pub fn connection(&self) -> &ConnectionState {
        self.supervisor.state()
    }

    pub fn reader(&self) -> &RegisterReader<B> {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut RegisterReader<B> {
        &mut self.reader
    }

    pub fn publisher(&self) -> &Publisher<S> {
        &self.publisher
    }

    pub fn status_line(&self) -> StatusLine {
        let state = self.supervisor.state();
        StatusLine {
            auto_enabled: self.policy.enabled,
            interval_secs: self.policy.interval_secs(),
            link_up: state.link.is_up(),
            session_up: state.session.is_up(),
        }
    }

    /// Menu followed by the status line.
    pub fn menu_reply(&self) -> Reply {
        Reply::Line(format!("{}\n{}", menu(), self.status_line()))
    }

    /// Advance the supervisor, then run an automatic read if one is due.
    pub async fn tick(&mut self) {
        let now = self.clock.now_ms();
        self.supervisor.tick(now);

        if self.policy.is_due(now, self.last_auto_read) {
            self.last_auto_read = now;
            // Failures are already logged by the publisher
            let _ = self.read_and_publish().await;
        }
    }

    /// Apply a session change, announcing birth on a fresh session.
    pub async fn on_session_event(&mut self, event: SessionEvent) {
        let now = self.clock.now_ms();
        if self.supervisor.on_session_event(event, now) {
            // A failed announcement is not retried until the next session
            let _ = self.publisher.announce_birth(now).await;
        }
    }

    /// Acquire a snapshot and publish it if possible.
    pub async fn read_and_publish(&mut self) -> Result<PublishOutcome, PublishError> {
        let timestamp = self.clock.now_ms();
        self.snapshot = self.builder.build(&mut self.reader, timestamp).await;
        self.publisher
            .publish(&self.snapshot, self.supervisor.is_online())
            .await
    }

    /// Handle one console line.
    pub async fn handle_line(&mut self, line: &str) -> Option<Reply> {
        match self.console.interpret(line) {
            Command::SetFanMode(mode) => Some(Reply::Line(self.set_fan_mode(mode).await)),
            Command::ReadNow => {
                let _ = self.read_and_publish().await;
                None
            }
            Command::ToggleAuto => {
                let enabled = self.policy.toggle();
                info!(enabled, "Automatic polling toggled");
                Some(Reply::Line(format!(
                    "Auto {}",
                    if enabled { "ON" } else { "OFF" }
                )))
            }
            Command::PromptInterval => Some(Reply::Prompt(INTERVAL_PROMPT)),
            Command::SetInterval(secs) => match self.policy.set_interval_secs(secs) {
                Ok(()) => {
                    info!(interval_secs = secs, "Poll interval changed");
                    Some(Reply::Line(format!("Interval: {} sec", secs)))
                }
                Err(e) => {
                    debug!(error = %e, "Interval rejected");
                    None
                }
            },
            Command::ShowMenu => Some(self.menu_reply()),
            Command::Unknown(_) => Some(Reply::Line(UNKNOWN_REPLY.to_string())),
            Command::Ignored => None,
        }
    }

    async fn set_fan_mode(&mut self, mode: u16) -> String {
        match self.reader.write_fan_mode(mode).await {
            Ok(mode) => format!("Fan mode {} OK", mode as u16),
            Err(CommandError::Validation(_)) => "ERROR: Mode 0-3 only".to_string(),
            Err(CommandError::Transport(e)) => format!("Fan mode ERROR: {}", e),
        }
    }

    /// Run until Ctrl+C.
    ///
    /// Console replies go to stdout. A closed channel disables its branch
    /// while the rest of the loop keeps running.
    pub async fn run(
        &mut self,
        mut lines: mpsc::Receiver<String>,
        mut events: mpsc::Receiver<SessionEvent>,
        tick: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let mut lines_open = true;
        let mut events_open = true;

        info!(tick_ms = tick.as_millis() as u64, "Control loop running");
        self.print(&self.menu_reply());

        loop {
            tokio::select! {
                biased;

                result = &mut shutdown => {
                    if let Err(e) = result {
                        warn!(error = %e, "Failed to listen for shutdown signal");
                    }
                    info!("Received shutdown signal");
                    break;
                }

                event = events.recv(), if events_open => match event {
                    Some(event) => self.on_session_event(event).await,
                    None => {
                        warn!("MQTT event loop stopped");
                        events_open = false;
                    }
                },

                line = lines.recv(), if lines_open => match line {
                    Some(line) => {
                        if let Some(reply) = self.handle_line(&line).await {
                            self.print(&reply);
                        }
                    }
                    None => {
                        debug!("Console input closed");
                        lines_open = false;
                    }
                },

                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    fn print(&self, reply: &Reply) {
        if let Err(e) = reply.write_to(&mut std::io::stdout()) {
            debug!(error = %e, "Console write failed");
        }
    }
}

impl<B, S> std::fmt::Debug for Controller<B, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("supervisor", &self.supervisor)
            .field("policy", &self.policy)
            .field("snapshot", &self.snapshot)
            .field("last_auto_read", &self.last_auto_read)
            .finish()
    }
}
