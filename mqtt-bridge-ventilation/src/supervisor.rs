//! Connectivity supervision.
//!
//! Network link and broker session are tracked independently as
//! `Down -> Connecting -> Up` state machines. Everything here is advanced from
//! the control loop tick with explicit timestamps and never blocks.

use std::fs;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::config::{LinkConfig, NetworkConfig};
use crate::error::LinkError;
use crate::session::SessionEvent;

/// State of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Down,
    Connecting,
    Up,
}

impl LinkState {
    pub fn is_up(&self) -> bool {
        matches!(self, LinkState::Up)
    }
}

/// Observable connectivity, mutated only by the [`Supervisor`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub link: LinkState,
    pub session: LinkState,
    /// Monotonic milliseconds of the last link or session reconnect attempt
    pub last_reconnect_attempt: Option<u64>,
}

impl ConnectionState {
    /// Both the link and the broker session are up.
    pub fn is_online(&self) -> bool {
        self.link.is_up() && self.session.is_up()
    }
}

/// A network link whose status can be polled.
pub trait NetworkLink {
    /// Current link status.
    fn is_up(&self) -> bool;

    /// Start bringing the link up; must return without waiting for it.
    fn begin_connect(&mut self) -> Result<(), LinkError>;
}

/// Link managed outside the bridge, always reported up.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnmanagedLink;

impl NetworkLink for UnmanagedLink {
    fn is_up(&self) -> bool {
        true
    }

    fn begin_connect(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Wired interface; status is its kernel operstate.
#[derive(Debug, Clone)]
pub struct WiredLink {
    interface: String,
    sysfs_root: PathBuf,
}

impl WiredLink {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            sysfs_root: PathBuf::from("/sys/class/net"),
        }
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    fn operstate_up(&self) -> bool {
        fs::read_to_string(self.sysfs_root.join(&self.interface).join("operstate"))
            .map(|state| state.trim() == "up")
            .unwrap_or(false)
    }
}

impl NetworkLink for WiredLink {
    fn is_up(&self) -> bool {
        self.operstate_up()
    }

    fn begin_connect(&mut self) -> Result<(), LinkError> {
        debug!(interface = %self.interface, "Waiting for carrier");
        Ok(())
    }
}

/// WiFi interface joined through NetworkManager.
///
/// At most one `nmcli` runs at a time. The password reaches it on stdin
/// (`--ask`) so it never shows up in the process list.
#[derive(Debug)]
pub struct WifiLink {
    status: WiredLink,
    ssid: String,
    password: Option<String>,
    program: PathBuf,
    attempt: Option<Child>,
}

impl WifiLink {
    pub fn new(interface: impl Into<String>, ssid: impl Into<String>, password: Option<String>) -> Self {
        Self {
            status: WiredLink::new(interface),
            ssid: ssid.into(),
            password,
            program: PathBuf::from("nmcli"),
            attempt: None,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn connect_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(7);
        if self.password.is_some() {
            args.push("--ask".to_string());
        }
        args.extend(["device", "wifi", "connect"].map(String::from));
        args.push(self.ssid.clone());
        args.push("ifname".to_string());
        args.push(self.status.interface.clone());
        args
    }

    /// Whether the previous `nmcli` is still running; reaps it otherwise.
    fn attempt_running(&mut self) -> bool {
        let Some(child) = self.attempt.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(%status, "nmcli finished");
                self.attempt = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to poll nmcli");
                self.attempt = None;
                false
            }
        }
    }
}

impl NetworkLink for WifiLink {
    fn is_up(&self) -> bool {
        self.status.operstate_up()
    }

    fn begin_connect(&mut self) -> Result<(), LinkError> {
        if self.attempt_running() {
            debug!(ssid = %self.ssid, "WiFi connect still in progress");
            return Ok(());
        }

        info!(ssid = %self.ssid, interface = %self.status.interface, "Connecting to WiFi");
        let stdin = if self.password.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = tokio::process::Command::new(&self.program)
            .args(self.connect_args())
            .stdin(stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LinkError::Link(format!("failed to run nmcli: {}", e)))?;

        if let (Some(mut stdin), Some(password)) = (child.stdin.take(), self.password.clone()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(format!("{}\n", password).as_bytes()).await {
                    debug!(error = %e, "Failed to pass WiFi password to nmcli");
                }
            });
        }
        self.attempt = Some(child);
        Ok(())
    }
}

/// Build the link described by the configuration.
pub fn link_from_config(config: &LinkConfig) -> Box<dyn NetworkLink> {
    match config {
        LinkConfig::Unmanaged => Box::new(UnmanagedLink),
        LinkConfig::Wired { interface } => Box::new(WiredLink::new(interface)),
        LinkConfig::Wifi {
            interface,
            ssid,
            password,
        } => Box::new(WifiLink::new(interface, ssid, password.clone())),
    }
}

/// Progress of a link bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    Down,
    Connecting { checks: u32, next_check: u64 },
    Up,
}

/// Owns the [`ConnectionState`] and advances both state machines.
pub struct Supervisor {
    link: Box<dyn NetworkLink>,
    phase: LinkPhase,
    max_attempts: u32,
    attempt_interval_ms: u64,
    state: ConnectionState,
}

impl Supervisor {
    pub fn new(link: Box<dyn NetworkLink>, config: &NetworkConfig) -> Self {
        Self {
            link,
            phase: LinkPhase::Down,
            max_attempts: config.max_attempts,
            attempt_interval_ms: config.attempt_interval_ms,
            state: ConnectionState::default(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    /// Advance the link state machine.
    pub fn tick(&mut self, now: u64) {
        self.phase = match self.phase {
            LinkPhase::Up if self.link.is_up() => LinkPhase::Up,
            LinkPhase::Up => {
                warn!("Network link lost, reconnecting");
                LinkPhase::Down
            }
            LinkPhase::Down if self.link.is_up() => {
                info!("Network link up");
                LinkPhase::Up
            }
            LinkPhase::Down => {
                self.state.last_reconnect_attempt = Some(now);
                if let Err(e) = self.link.begin_connect() {
                    warn!(error = %e, "Link bring-up failed to start");
                }
                LinkPhase::Connecting {
                    checks: 0,
                    next_check: now + self.attempt_interval_ms,
                }
            }
            LinkPhase::Connecting { next_check, .. } if now < next_check => self.phase,
            LinkPhase::Connecting { .. } if self.link.is_up() => {
                info!("Network link up");
                LinkPhase::Up
            }
            LinkPhase::Connecting { checks, .. } if checks + 1 >= self.max_attempts => {
                warn!(checks = checks + 1, "Network link failed");
                LinkPhase::Down
            }
            LinkPhase::Connecting { checks, .. } => LinkPhase::Connecting {
                checks: checks + 1,
                next_check: now + self.attempt_interval_ms,
            },
        };

        self.state.link = match self.phase {
            LinkPhase::Down => LinkState::Down,
            LinkPhase::Connecting { .. } => LinkState::Connecting,
            LinkPhase::Up => LinkState::Up,
        };
    }

    /// Apply a session change; returns `true` on a `Down -> Up` transition,
    /// when the birth certificates must be announced.
    pub fn on_session_event(&mut self, event: SessionEvent, now: u64) -> bool {
        match event {
            SessionEvent::Connected => {
                if self.state.session.is_up() {
                    debug!("Already connected, ignoring ConnAck");
                    return false;
                }
                info!("MQTT connected");
                self.state.session = LinkState::Up;
                true
            }
            SessionEvent::Disconnected(e) => {
                if self.state.session.is_up() {
                    warn!(error = %e, "MQTT session lost");
                } else {
                    debug!(error = %e, "MQTT connect attempt failed");
                }
                self.state.session = LinkState::Down;
                false
            }
            SessionEvent::Reconnecting => {
                self.state.session = LinkState::Connecting;
                self.state.last_reconnect_attempt = Some(now);
                false
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("phase", &self.phase)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Debug, Clone, Default)]
    struct FakeLink {
        up: Rc<Cell<bool>>,
        connects: Rc<Cell<u32>>,
    }

    impl NetworkLink for FakeLink {
        fn is_up(&self) -> bool {
            self.up.get()
        }

        fn begin_connect(&mut self) -> Result<(), LinkError> {
            self.connects.set(self.connects.get() + 1);
            Ok(())
        }
    }

    fn supervisor(link: &FakeLink) -> Supervisor {
        let config = NetworkConfig {
            max_attempts: 3,
            attempt_interval_ms: 1000,
            ..NetworkConfig::default()
        };
        Supervisor::new(Box::new(link.clone()), &config)
    }

    #[test]
    fn test_link_already_up() {
        let link = FakeLink::default();
        link.up.set(true);
        let mut sup = supervisor(&link);

        sup.tick(0);
        assert_eq!(sup.state().link, LinkState::Up);
        assert_eq!(link.connects.get(), 0);
    }

    #[test]
    fn test_link_comes_up_while_connecting() {
        let link = FakeLink::default();
        let mut sup = supervisor(&link);

        sup.tick(0);
        assert_eq!(sup.state().link, LinkState::Connecting);
        assert_eq!(link.connects.get(), 1);
        assert_eq!(sup.state().last_reconnect_attempt, Some(0));

        // Status is only checked once the attempt interval has elapsed
        link.up.set(true);
        sup.tick(500);
        assert_eq!(sup.state().link, LinkState::Connecting);

        sup.tick(1000);
        assert_eq!(sup.state().link, LinkState::Up);
    }

    #[test]
    fn test_link_attempts_exhausted() {
        let link = FakeLink::default();
        let mut sup = supervisor(&link);

        sup.tick(0);
        sup.tick(1000);
        sup.tick(2000);
        assert_eq!(sup.state().link, LinkState::Connecting);

        sup.tick(3000);
        assert_eq!(sup.state().link, LinkState::Down);

        // Next tick starts a fresh attempt
        sup.tick(3100);
        assert_eq!(sup.state().link, LinkState::Connecting);
        assert_eq!(link.connects.get(), 2);
        assert_eq!(sup.state().last_reconnect_attempt, Some(3100));
    }

    #[test]
    fn test_link_lost() {
        let link = FakeLink::default();
        link.up.set(true);
        let mut sup = supervisor(&link);
        sup.tick(0);

        link.up.set(false);
        sup.tick(100);
        assert_eq!(sup.state().link, LinkState::Down);
    }

    #[test]
    fn test_birth_edge_once_per_session() {
        let link = FakeLink::default();
        let mut sup = supervisor(&link);

        assert!(sup.on_session_event(SessionEvent::Connected, 0));
        assert!(!sup.on_session_event(SessionEvent::Connected, 10));

        let lost = SessionEvent::Disconnected(LinkError::Session("reset".to_string()));
        assert!(!sup.on_session_event(lost, 20));
        assert_eq!(sup.state().session, LinkState::Down);

        assert!(!sup.on_session_event(SessionEvent::Reconnecting, 5020));
        assert_eq!(sup.state().session, LinkState::Connecting);
        assert_eq!(sup.state().last_reconnect_attempt, Some(5020));

        assert!(sup.on_session_event(SessionEvent::Connected, 5030));
    }

    #[test]
    fn test_online_requires_both() {
        let link = FakeLink::default();
        link.up.set(true);
        let mut sup = supervisor(&link);

        sup.on_session_event(SessionEvent::Connected, 0);
        assert!(!sup.is_online());

        sup.tick(0);
        assert!(sup.is_online());
    }

    #[test]
    fn test_wired_operstate() {
        let root = std::env::temp_dir().join(format!("ventsight-net-{}", std::process::id()));
        fs::create_dir_all(root.join("eth0")).unwrap();

        let link = WiredLink::new("eth0").with_sysfs_root(&root);
        fs::write(root.join("eth0/operstate"), "up\n").unwrap();
        assert!(link.is_up());

        fs::write(root.join("eth0/operstate"), "down\n").unwrap();
        assert!(!link.is_up());

        assert!(!WiredLink::new("missing0").with_sysfs_root(&root).is_up());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_wifi_connect_args() {
        let link = WifiLink::new("wlan0", "plant", Some("secret".to_string()));
        assert_eq!(
            link.connect_args(),
            vec!["--ask", "device", "wifi", "connect", "plant", "ifname", "wlan0"]
        );

        let open = WifiLink::new("wlan0", "guest", None);
        assert_eq!(
            open.connect_args(),
            vec!["device", "wifi", "connect", "guest", "ifname", "wlan0"]
        );
    }

    /// Executable shell script in a scratch directory.
    fn script(name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("ventsight-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nmcli");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_wifi_password_on_stdin() {
        let program = script("wifi-stdin", "read pw; echo \"$pw|$*\" > \"$(dirname \"$0\")/log\"");
        let mut link = WifiLink::new("wlan0", "plant", Some("secret".to_string())).with_program(&program);

        link.begin_connect().unwrap();
        link.attempt.as_mut().unwrap().wait().await.unwrap();

        let log = fs::read_to_string(program.with_file_name("log")).unwrap();
        assert_eq!(log.trim(), "secret|--ask device wifi connect plant ifname wlan0");

        fs::remove_dir_all(program.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_wifi_single_attempt_in_flight() {
        let program = script("wifi-busy", "sleep 5");
        let mut link = WifiLink::new("wlan0", "plant", None).with_program(&program);

        link.begin_connect().unwrap();
        let first = link.attempt.as_ref().and_then(Child::id);
        link.begin_connect().unwrap();
        assert_eq!(link.attempt.as_ref().and_then(Child::id), first);

        // A finished attempt makes room for the next one
        link.attempt.as_mut().unwrap().kill().await.unwrap();
        link.begin_connect().unwrap();
        assert_ne!(link.attempt.as_ref().and_then(Child::id), first);

        drop(link);
        fs::remove_dir_all(program.parent().unwrap()).unwrap();
    }
}
