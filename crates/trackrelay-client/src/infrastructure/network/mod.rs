//! Network infrastructure for the client application.
//!
//! Handles the connection to a device server and mirrors the server's
//! devices into a [`DeviceStateTable`].
//!
//! Architecture:
//! - `DeviceClient` runs a reconnect loop on its own task.
//! - Each session builds a fresh state table from the server's descriptor
//!   table, then applies every state update to it.
//! - Events are delivered to the caller on an `mpsc` channel.  Consumers
//!   read device state from the table they were handed, at their own pace.
//! - When a session ends, every device in its table is marked invalid
//!   before `Disconnected` is sent, so nothing downstream keeps showing a
//!   frozen pose.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use trackrelay_core::protocol::messages::PROTOCOL_VERSION;
use trackrelay_core::{ClientSession, DeviceStateTable, DisconnectReason, Endpoint, SessionError};

/// Configuration for the client's connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Sent to the server in `HELLO`.
    pub client_name: String,
    /// Highest protocol version offered.
    pub protocol_version: u32,
    /// Wait between connection attempts.
    pub reconnect_interval: Duration,
    /// Longest allowed silence from the server, including connect and handshake.
    pub idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::tcp("127.0.0.1", 8555),
            client_name: "trackrelay-client".to_string(),
            protocol_version: PROTOCOL_VERSION,
            reconnect_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(3),
        }
    }
}

/// Events emitted by the network layer to the application layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A session was established.  `table` holds the server's devices.
    Connected {
        server: String,
        version: u32,
        table: Arc<DeviceStateTable>,
    },
    /// An update was applied to `table`; `devices` lists the indices it touched.
    Updated {
        table: Arc<DeviceStateTable>,
        devices: Vec<usize>,
    },
    /// The session ended; every device in `table` is now invalid.
    Disconnected {
        table: Arc<DeviceStateTable>,
        reason: String,
    },
}

/// Queued events before the client waits for the consumer.
const EVENT_QUEUE: usize = 128;

/// A reconnecting device client.
pub struct DeviceClient {
    config: ClientConfig,
}

impl DeviceClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Spawns the reconnect loop and returns its event stream.
    ///
    /// The loop ends when `shutdown` becomes `true` (the open session is
    /// closed politely) or when the receiver is dropped.
    pub fn start(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<ClientEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let handle = tokio::spawn(async move { self.run(tx, shutdown).await });
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<ClientEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() || tx.is_closed() {
                break;
            }

            let mut current: Option<Arc<DeviceStateTable>> = None;
            let result = tokio::select! {
                result = self.run_session(&tx, &mut current, &mut shutdown) => result,
                _ = tx.closed() => break,
            };

            let reason = match result {
                Ok(()) => "closed".to_string(),
                Err(e) => {
                    warn!(endpoint = %self.config.endpoint, error = %e, "session ended");
                    e.to_string()
                }
            };
            if let Some(table) = current {
                table.invalidate_all();
                if tx.send(ClientEvent::Disconnected { table, reason }).await.is_err() {
                    break;
                }
            }

            tokio::select! {
                _ = time::sleep(self.config.reconnect_interval) => {}
                _ = stop_requested(&mut shutdown) => break,
            }
        }
        debug!("device client stopped");
    }

    /// One session.  Returns `Ok(())` when it ends on shutdown.
    async fn run_session(
        &self,
        tx: &mpsc::Sender<ClientEvent>,
        current: &mut Option<Arc<DeviceStateTable>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let idle = self.config.idle_timeout;
        let mut session = time::timeout(
            idle,
            ClientSession::connect(
                &self.config.endpoint,
                &self.config.client_name,
                self.config.protocol_version,
            ),
        )
        .await
        .map_err(|_| SessionError::Timeout(idle))??;

        let table = Arc::new(DeviceStateTable::new(session.devices().to_vec()));
        *current = Some(Arc::clone(&table));
        info!(
            endpoint = %self.config.endpoint,
            server = %session.info().peer_name,
            version = session.info().version,
            devices = table.len(),
            "connected to device server"
        );
        let connected = ClientEvent::Connected {
            server: session.info().peer_name.clone(),
            version: session.info().version,
            table: Arc::clone(&table),
        };
        if tx.send(connected).await.is_err() {
            return Ok(());
        }

        loop {
            let update = tokio::select! {
                update = session.next_update_within(idle) => update?,
                _ = stop_requested(shutdown) => {
                    // The read was cancelled mid-frame at worst; the session ends here anyway.
                    let _ = session.close(DisconnectReason::Shutdown).await;
                    return Ok(());
                }
            };
            let outcome = table.apply_update(&update)?;
            if !outcome.late.is_empty() {
                debug!(late = ?outcome.late, "out-of-order time stamps");
            }
            let devices = update.devices.iter().map(|d| d.device as usize).collect();
            if tx
                .send(ClientEvent::Updated {
                    table: Arc::clone(&table),
                    devices,
                })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }
}

/// Resolves once `signal` reads `true`, or once its sender is gone.
///
/// The `watch::Ref` from `wait_for` is dropped inside, so it never lives
/// across another `select!` branch's `.await` and the task stays `Send`.
async fn stop_requested(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use trackrelay_core::protocol::messages::{DeviceUpdate, Message, StateUpdate};
    use trackrelay_core::{
        Channel, DeviceDescriptor, Listener, Pose, ServerSession, TrackingType, Vec3,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn devices() -> Vec<DeviceDescriptor> {
        vec![DeviceDescriptor::new("tracker0", TrackingType::Position)]
    }

    /// Serves sessions that each send one update and then hang up.
    async fn flaky_server() -> Endpoint {
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
        let endpoint = listener.local_endpoint().clone();
        tokio::spawn(async move {
            let mut x = 0.0;
            while let Ok((stream, _)) = listener.accept().await {
                x += 1.0;
                let Ok(channel) = Channel::establish(stream).await else { continue };
                let accepted =
                    ServerSession::accept(channel, "flaky", PROTOCOL_VERSION, &devices()).await;
                let Ok(session) = accepted else { continue };
                let (_reader, mut writer, _) = session.into_split();
                let update = StateUpdate::new(vec![DeviceUpdate::new(0)
                    .with_pose(Pose::at(Vec3::new(x, 0.0, 0.0)))
                    .with_valid(true)]);
                let _ = writer.write_message(&Message::StateUpdate(update)).await;
                let _ = writer.disconnect(DisconnectReason::Shutdown).await;
            }
        });
        endpoint
    }

    fn config(endpoint: Endpoint) -> ClientConfig {
        ClientConfig {
            endpoint,
            reconnect_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    async fn next(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_client_config_default_targets_local_server() {
        // Arrange / Act
        let cfg = ClientConfig::default();

        // Assert
        assert_eq!(cfg.endpoint, Endpoint::tcp("127.0.0.1", 8555));
        assert_eq!(cfg.protocol_version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_session_events_arrive_in_order() {
        // Arrange
        let endpoint = flaky_server().await;
        let (_stop, stop_rx) = watch::channel(false);

        // Act
        let (mut rx, _task) = DeviceClient::new(config(endpoint)).start(stop_rx);

        // Assert
        let ClientEvent::Connected { server, table, .. } = next(&mut rx).await else {
            panic!("expected Connected");
        };
        assert_eq!(server, "flaky");
        assert_eq!(table.len(), 1);

        let ClientEvent::Updated { devices, table } = next(&mut rx).await else {
            panic!("expected Updated");
        };
        assert_eq!(devices, vec![0]);
        assert_eq!(table.device(0).unwrap().pose.position.x, 1.0);

        let ClientEvent::Disconnected { table, .. } = next(&mut rx).await else {
            panic!("expected Disconnected");
        };
        assert!(!table.device(0).unwrap().valid);
    }

    #[tokio::test]
    async fn test_client_reconnects_with_a_fresh_table() {
        // Arrange
        let endpoint = flaky_server().await;
        let (_stop, stop_rx) = watch::channel(false);
        let (mut rx, _task) = DeviceClient::new(config(endpoint)).start(stop_rx);

        // Act: skip the first session
        let mut connects = 0;
        let second = loop {
            if let ClientEvent::Connected { table, .. } = next(&mut rx).await {
                connects += 1;
                if connects == 2 {
                    break table;
                }
            }
        };

        // Assert
        let ClientEvent::Updated { table, .. } = next(&mut rx).await else {
            panic!("expected Updated");
        };
        assert!(Arc::ptr_eq(&table, &second));
        assert_eq!(table.device(0).unwrap().pose.position.x, 2.0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        // Arrange: nothing listens here, so the client keeps retrying
        let endpoint = {
            let listener = Listener::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
            listener.local_endpoint().clone()
        };
        let (stop, stop_rx) = watch::channel(false);
        let (_rx, task) = DeviceClient::new(config(endpoint)).start(stop_rx);

        // Act
        stop.send_replace(true);

        // Assert
        time::timeout(WAIT, task).await.unwrap().unwrap();
    }
}
