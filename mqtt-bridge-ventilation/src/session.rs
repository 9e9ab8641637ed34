//! MQTT broker session.
//!
//! The rumqttc event loop runs in its own task and reports session changes to
//! the control loop over a channel, so a broker outage never stalls polling or
//! console handling.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ventsight_common::MqttConfig;

use crate::error::LinkError;

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 16;

/// Session change reported by the event-loop task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Broker accepted the connection
    Connected,
    /// Connection failed or dropped
    Disconnected(LinkError),
    /// Backoff elapsed, a new attempt is starting
    Reconnecting,
}

/// Build the MQTT options for a bridge node.
///
/// The client id is the node id with a random 16-bit suffix so that a
/// restarted bridge does not collide with its own stale session. A username
/// without a password is sent with an empty password.
pub fn mqtt_options(config: &MqttConfig, node_id: &str) -> MqttOptions {
    let client_id = format!("{}_{:x}", node_id, rand::random::<u16>());
    let mut options = MqttOptions::new(client_id, &config.host, config.port);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }

    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);
    options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

    options
}

/// Create the client handle and the event loop that drives it.
pub fn connect(config: &MqttConfig, node_id: &str) -> (AsyncClient, EventLoop) {
    let options = mqtt_options(config, node_id);

    info!(
        host = %config.host,
        port = config.port,
        client_id = %options.client_id(),
        "Connecting to MQTT broker"
    );

    AsyncClient::new(options, REQUEST_CAPACITY)
}

/// Drives the rumqttc event loop and forwards session changes.
pub struct SessionPump {
    eventloop: EventLoop,
    events: mpsc::Sender<SessionEvent>,
    backoff: Duration,
}

impl SessionPump {
    pub fn new(eventloop: EventLoop, events: mpsc::Sender<SessionEvent>, backoff: Duration) -> Self {
        Self {
            eventloop,
            events,
            backoff,
        }
    }

    /// Run until the control loop goes away.
    pub async fn run(mut self) {
        loop {
            let event = match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!(session_present = ack.session_present, "ConnAck received");
                    Some(SessionEvent::Connected)
                }
                Ok(Event::Incoming(Packet::Disconnect)) => Some(SessionEvent::Disconnected(
                    LinkError::Session("broker sent disconnect".to_string()),
                )),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, backoff_ms = self.backoff.as_millis() as u64, "MQTT connection error");
                    if self
                        .events
                        .send(SessionEvent::Disconnected(LinkError::Session(e.to_string())))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    tokio::time::sleep(self.backoff).await;
                    Some(SessionEvent::Reconnecting)
                }
            };

            if let Some(event) = event {
                if self.events.send(event).await.is_err() {
                    debug!("Control loop gone, stopping MQTT event loop");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_prefix() {
        let config = MqttConfig::default();
        let options = mqtt_options(&config, "OLIMEX_POE");

        let client_id = options.client_id();
        let suffix = client_id.strip_prefix("OLIMEX_POE_").unwrap();
        assert!(u16::from_str_radix(suffix, 16).is_ok());
    }

    #[test]
    fn test_options_from_config() {
        let config = MqttConfig {
            host: "172.20.10.5".to_string(),
            username: Some("edgeuser".to_string()),
            password: Some("secret".to_string()),
            keep_alive_secs: 15,
            ..MqttConfig::default()
        };
        let options = mqtt_options(&config, "node");

        assert_eq!(options.broker_address(), ("172.20.10.5".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
        assert_eq!(
            options.credentials(),
            Some(("edgeuser".to_string(), "secret".to_string()))
        );
        assert!(options.clean_session());
    }

    #[test]
    fn test_username_without_password() {
        let config = MqttConfig {
            username: Some("edgeuser".to_string()),
            ..MqttConfig::default()
        };
        let options = mqtt_options(&config, "node");

        assert_eq!(
            options.credentials(),
            Some(("edgeuser".to_string(), String::new()))
        );
    }

    mod pump {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use tokio::time::{Instant, timeout};

        use super::*;

        const WAIT: Duration = Duration::from_secs(5);

        fn local(port: u16) -> MqttConfig {
            MqttConfig {
                host: "127.0.0.1".to_string(),
                port,
                ..MqttConfig::default()
            }
        }

        async fn closed_port() -> u16 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        }

        #[tokio::test(start_paused = true)]
        async fn test_unreachable_broker_backs_off() {
            let (_client, eventloop) = connect(&local(closed_port().await), "node");
            let (tx, mut rx) = mpsc::channel(4);
            let backoff = Duration::from_millis(5000);
            tokio::spawn(SessionPump::new(eventloop, tx, backoff).run());

            assert!(matches!(
                rx.recv().await,
                Some(SessionEvent::Disconnected(LinkError::Session(_)))
            ));
            let failed_at = Instant::now();

            assert_eq!(rx.recv().await, Some(SessionEvent::Reconnecting));
            assert!(failed_at.elapsed() >= backoff);
        }

        #[tokio::test]
        async fn test_connack_reports_connected() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 256];
                let _ = socket.read(&mut buf).await;
                // CONNACK, connection accepted
                socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
                // Then close our side as a dying broker would
                let _ = socket.shutdown().await;
                while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
            });

            let (_client, eventloop) = connect(&local(port), "node");
            let (tx, mut rx) = mpsc::channel(4);
            tokio::spawn(SessionPump::new(eventloop, tx, Duration::from_millis(50)).run());

            let first = timeout(WAIT, rx.recv()).await.unwrap();
            assert_eq!(first, Some(SessionEvent::Connected));

            let second = timeout(WAIT, rx.recv()).await.unwrap();
            assert!(matches!(second, Some(SessionEvent::Disconnected(_))));
        }

        #[tokio::test]
        async fn test_pump_stops_without_receiver() {
            let (_client, eventloop) = connect(&local(closed_port().await), "node");
            let (tx, rx) = mpsc::channel(4);
            drop(rx);

            let pump = SessionPump::new(eventloop, tx, Duration::from_secs(60)).run();
            assert!(timeout(WAIT, pump).await.is_ok());
        }
    }
}
