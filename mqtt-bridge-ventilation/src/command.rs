//! Operator console.
//!
//! Lines arrive from stdin. Normally only the first character of a line is a
//! command; after `i` the next line is read as the new poll interval.

use std::fmt;

use tracing::debug;

use crate::config::{MAX_INTERVAL_SECS, MIN_INTERVAL_SECS, PollingConfig};
use crate::error::ValidationError;

/// Prompt printed after `i`.
pub const INTERVAL_PROMPT: &str = "Seconds (5-300): ";

/// Reply to an unrecognized command character.
pub const UNKNOWN_REPLY: &str = "Unknown. 'm' for menu";

/// Automatic polling settings, owned by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl PollingPolicy {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval_ms: config.interval_secs * 1000,
        }
    }

    /// Flip automatic polling; returns the new state.
    pub fn toggle(&mut self) -> bool {
        self.enabled = !self.enabled;
        self.enabled
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_ms / 1000
    }

    /// Set the interval; values outside 5-300 s leave the policy unchanged.
    pub fn set_interval_secs(&mut self, secs: i64) -> Result<(), ValidationError> {
        let range = MIN_INTERVAL_SECS as i64..=MAX_INTERVAL_SECS as i64;
        if !range.contains(&secs) {
            return Err(ValidationError::Interval(secs));
        }
        self.interval_ms = secs as u64 * 1000;
        Ok(())
    }

    /// Whether an automatic read is due at `now`.
    pub fn is_due(&self, now: u64, last_read: u64) -> bool {
        self.enabled && now.saturating_sub(last_read) >= self.interval_ms
    }
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self::from_config(&PollingConfig::default())
    }
}

/// A decoded console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `0`-`3`
    SetFanMode(u16),
    /// `r`
    ReadNow,
    /// `a`
    ToggleAuto,
    /// `i`, the value follows on the next line
    PromptInterval,
    /// Line entered after `i`
    SetInterval(i64),
    /// `m`
    ShowMenu,
    Unknown(char),
    /// Empty line
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ConsoleState {
    #[default]
    AwaitingCommand,
    AwaitingIntervalValue,
}

/// Turns console lines into [`Command`]s.
#[derive(Debug, Default)]
pub struct Console {
    state: ConsoleState,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the next line will be read as an interval value.
    pub fn awaiting_interval(&self) -> bool {
        self.state == ConsoleState::AwaitingIntervalValue
    }

    pub fn interpret(&mut self, line: &str) -> Command {
        if self.state == ConsoleState::AwaitingIntervalValue {
            self.state = ConsoleState::AwaitingCommand;
            return Command::SetInterval(parse_int(line));
        }

        let Some(c) = line.trim().chars().next() else {
            return Command::Ignored;
        };

        let command = match c {
            '0'..='3' => Command::SetFanMode(c as u16 - '0' as u16),
            'r' => Command::ReadNow,
            'a' => Command::ToggleAuto,
            'i' => {
                self.state = ConsoleState::AwaitingIntervalValue;
                Command::PromptInterval
            }
            'm' => Command::ShowMenu,
            other => Command::Unknown(other),
        };
        debug!(?command, "Console command");
        command
    }
}

/// Leading integer of `input`, skipping anything before it; 0 when there is none.
///
/// Saturates instead of overflowing.
pub fn parse_int(input: &str) -> i64 {
    let mut chars = input.chars().peekable();
    let mut negative = false;

    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            break;
        }
        chars.next();
        if c == '-' && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            negative = true;
            break;
        }
    }

    let mut value: i64 = 0;
    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
        value = value.saturating_mul(10).saturating_add(digit as i64);
        chars.next();
    }

    if negative { -value } else { value }
}

/// The command menu.
pub fn menu() -> &'static str {
    "\n=== DV10 CONTROLLER ===\n\
     0=Off 1=Reduced 2=Normal 3=Auto\n\
     r=Read a=AutoRead i=Interval m=Menu"
}

/// One-line summary printed with the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusLine {
    pub auto_enabled: bool,
    pub interval_secs: u64,
    pub link_up: bool,
    pub session_up: bool,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |b: bool| if b { "OK" } else { "NO" };
        write!(
            f,
            "Auto: {} ({}s) | Link: {} | MQTT: {}",
            if self.auto_enabled { "ON" } else { "OFF" },
            self.interval_secs,
            flag(self.link_up),
            flag(self.session_up)
        )
    }
}
