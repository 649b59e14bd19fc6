//! DeviceServer: accepts clients and streams registry state to each of them.
//!
//! # Per-client session (for beginners)
//!
//! ```text
//!   accept ─▶ endianness + handshake (bounded by handshake_timeout)
//!              │
//!              ▼
//!   ┌──────── write loop ────────┐        ┌─── reader task ───┐
//!   │ registry changed → publish │ ◀─mpsc─│ read_message()    │
//!   │ keepalive tick   → PING    │        │ (never cancelled) │
//!   │ inbound message  → PONG…   │        └───────────────────┘
//!   │ shutdown         → DISCONNECT
//!   └────────────────────────────┘
//! ```
//!
//! Inbound frames are read by their own task and handed over through a
//! channel, because a frame read that `tokio::select!` cancels half-way
//! would leave the stream misaligned.
//!
//! Every session exports the registry's descriptor table as it was at
//! handshake time.  When the registry's generation moves on, the session
//! ends with `DISCONNECT { DeviceSetChanged }`; the client reconnects and
//! receives the new table.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::WriteHalf;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use trackrelay_core::protocol::messages::{MessageType, PROTOCOL_VERSION};
use trackrelay_core::protocol::session::MessageWriter;
use trackrelay_core::{
    Channel, ChannelError, DeviceDescriptor, DeviceRegistry, DisconnectReason, Endpoint,
    Listener, LocalRegistry, Message, ProtocolError, ServerSession, SessionError, Stream,
};

use crate::application::publish_state::StatePublisher;
use crate::application::stop_requested;

/// A client that stays silent for this many keepalive intervals is dropped.
const PEER_TIMEOUT_INTERVALS: u32 = 3;

/// Inbound messages buffered between the reader task and the write loop.
const INBOUND_QUEUE: usize = 32;

/// Error type for the device server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
}

/// Per-server session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    /// Sent to clients in `SERVER_HELLO`.
    pub name: String,
    /// Highest protocol version advertised.
    pub protocol_version: u32,
    pub keepalive_interval: Duration,
    /// Bound on endianness negotiation plus handshake.
    pub handshake_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: "trackrelay".into(),
            protocol_version: PROTOCOL_VERSION,
            keepalive_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

impl ServerOptions {
    fn peer_timeout(&self) -> Duration {
        self.keepalive_interval * PEER_TIMEOUT_INTERVALS
    }
}

/// A listening device server.
pub struct DeviceServer {
    listener: Listener,
    registry: Arc<DeviceRegistry>,
    options: Arc<ServerOptions>,
}

impl DeviceServer {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the endpoint cannot be bound.
    pub async fn bind(
        endpoint: &Endpoint,
        registry: Arc<DeviceRegistry>,
        options: ServerOptions,
    ) -> Result<Self, ServerError> {
        let listener = Listener::bind(endpoint).await.map_err(|source| ServerError::Bind {
            endpoint: endpoint.clone(),
            source,
        })?;
        info!(
            endpoint = %listener.local_endpoint(),
            name = %options.name,
            "device server listening"
        );
        Ok(Self {
            listener,
            registry,
            options: Arc::new(options),
        })
    }

    /// The endpoint clients connect to (with the real port if bound to port 0).
    pub fn local_endpoint(&self) -> &Endpoint {
        self.listener.local_endpoint()
    }

    /// Serves clients until `shutdown` becomes `true`, then says goodbye to
    /// every client and returns once all sessions have ended.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "client accepted");
                        clients.spawn(serve_client(
                            stream,
                            peer,
                            Arc::clone(&self.registry),
                            Arc::clone(&self.options),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(finished) = clients.join_next(), if !clients.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "client task failed");
                    }
                }
                _ = stop_requested(&mut shutdown) => break,
            }
        }

        info!(
            endpoint = %self.listener.local_endpoint(),
            clients = clients.len(),
            "device server shutting down"
        );
        while clients.join_next().await.is_some() {}
    }
}

// ── Per-client session ────────────────────────────────────────────────────────

/// Aborts the reader task when the session ends on any path.
struct ReaderGuard(JoinHandle<()>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn serve_client(
    stream: Stream,
    peer: String,
    registry: Arc<DeviceRegistry>,
    options: Arc<ServerOptions>,
    shutdown: watch::Receiver<bool>,
) {
    match run_client(stream, &peer, &registry, &options, shutdown).await {
        Ok(reason) => info!(%peer, %reason, "client session ended"),
        Err(SessionError::Disconnected(reason)) => info!(%peer, %reason, "client disconnected"),
        Err(e) => warn!(%peer, error = %e, "client session failed"),
    }
}

async fn run_client(
    stream: Stream,
    peer: &str,
    registry: &DeviceRegistry,
    options: &ServerOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<DisconnectReason, SessionError> {
    // Subscribe before taking the snapshot so no change can slip between them.
    let mut changes = registry.subscribe_changes();
    let mut layout = registry.subscribe_layout();
    let snapshot = registry.snapshot();

    let limit = options.handshake_timeout;
    let session = time::timeout(limit, handshake(stream, options, &snapshot.descriptors()))
        .await
        .map_err(|_| SessionError::Timeout(limit))??;
    let (mut reader, mut writer, info) = session.into_split();
    info!(
        %peer,
        client = %info.peer_name,
        version = info.version,
        devices = snapshot.devices.len(),
        "client connected"
    );

    let (inbound_tx, mut inbound) = mpsc::channel(INBOUND_QUEUE);
    let _reader = ReaderGuard(tokio::spawn(async move {
        loop {
            let result = reader.read_message().await;
            let failed = result.is_err();
            if inbound_tx.send(result).await.is_err() || failed {
                break;
            }
        }
    }));

    let mut publisher = StatePublisher::new(&snapshot, info.capabilities);
    let peer_timeout = options.peer_timeout();
    let period = options.keepalive_interval;
    let mut keepalive = time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_heard = Instant::now();
    let mut ping_token: u64 = 0;
    let mut dirty = true;

    let outcome: Result<DisconnectReason, SessionError> = loop {
        if dirty {
            dirty = false;
            changes.borrow_and_update();
            layout.borrow_and_update();
            match publisher.next_update(&registry.snapshot()) {
                Ok(Some(update)) => {
                    let msg = Message::StateUpdate(update);
                    if let Err(e) = send(&mut writer, &msg, peer_timeout).await {
                        break Err(e);
                    }
                }
                Ok(None) => {}
                Err(changed) => {
                    debug!(%peer, %changed, "ending session on device set change");
                    break Ok(DisconnectReason::DeviceSetChanged);
                }
            }
        }

        tokio::select! {
            changed = changes.changed() => match changed {
                Ok(()) => dirty = true,
                Err(_) => break Ok(DisconnectReason::Shutdown),
            },
            changed = layout.changed() => match changed {
                Ok(()) => dirty = true,
                Err(_) => break Ok(DisconnectReason::Shutdown),
            },
            _ = keepalive.tick() => {
                if last_heard.elapsed() > peer_timeout {
                    break Err(SessionError::Timeout(peer_timeout));
                }
                ping_token = ping_token.wrapping_add(1);
                if let Err(e) = send(&mut writer, &Message::Ping(ping_token), peer_timeout).await {
                    break Err(e);
                }
            }
            received = inbound.recv() => match received {
                Some(Ok(msg)) => {
                    last_heard = Instant::now();
                    match msg {
                        Message::Pong(_) => {}
                        Message::Ping(token) => {
                            let pong = Message::Pong(token);
                            if let Err(e) = send(&mut writer, &pong, peer_timeout).await {
                                break Err(e);
                            }
                        }
                        Message::Disconnect { reason } => {
                            break Err(SessionError::Disconnected(reason));
                        }
                        other => {
                            break Err(ProtocolError::UnexpectedMessage {
                                expected: MessageType::Pong,
                                received: other.message_type(),
                            }
                            .into());
                        }
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Err(ChannelError::Closed.into()),
            },
            _ = stop_requested(&mut shutdown) => break Ok(DisconnectReason::Shutdown),
        }
    };

    let reason = match outcome {
        Ok(reason) => reason,
        Err(e @ (SessionError::Disconnected(_) | SessionError::Channel(_))) => return Err(e),
        Err(e) => {
            say_goodbye(&mut writer, e.disconnect_reason(), peer_timeout, peer).await;
            return Err(e);
        }
    };
    say_goodbye(&mut writer, reason, peer_timeout, peer).await;
    Ok(reason)
}

async fn handshake(
    stream: Stream,
    options: &ServerOptions,
    devices: &[DeviceDescriptor],
) -> Result<ServerSession<Stream>, SessionError> {
    let channel = Channel::establish(stream).await?;
    ServerSession::accept(channel, &options.name, options.protocol_version, devices).await
}

/// Best-effort `DISCONNECT`; the session is over either way.
async fn say_goodbye(
    writer: &mut MessageWriter<WriteHalf<Stream>>,
    reason: DisconnectReason,
    limit: Duration,
    peer: &str,
) {
    match time::timeout(limit, writer.disconnect(reason)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%peer, error = %e, "could not send disconnect"),
        Err(_) => debug!(%peer, "client did not take the disconnect in time"),
    }
}

/// Writes one message, treating a stalled client as timed out.
async fn send(
    writer: &mut MessageWriter<WriteHalf<Stream>>,
    msg: &Message,
    limit: Duration,
) -> Result<(), SessionError> {
    time::timeout(limit, writer.write_message(msg))
        .await
        .map_err(|_| SessionError::Timeout(limit))?
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use trackrelay_core::{
        ClientSession, DeviceOwner, DeviceUpdate, Pose, StateUpdate, TrackingType, Vec3,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn registry() -> Arc<DeviceRegistry> {
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register_devices(
                DeviceOwner::Local,
                &[
                    DeviceDescriptor::new("tracker0", TrackingType::PositionOrientation),
                    DeviceDescriptor::new("tracker1", TrackingType::Position),
                ],
            )
            .unwrap();
        registry
    }

    fn move_to(device: u16, x: f32, ts: u64) -> StateUpdate {
        StateUpdate::new(vec![DeviceUpdate::new(device)
            .with_pose(Pose::at(Vec3::new(x, 0.0, 0.0)))
            .with_time_stamp(ts)])
    }

    async fn start_server(
        registry: Arc<DeviceRegistry>,
        options: ServerOptions,
    ) -> (Endpoint, watch::Sender<bool>, JoinHandle<()>) {
        let server = DeviceServer::bind(&Endpoint::tcp("127.0.0.1", 0), registry, options)
            .await
            .unwrap();
        let endpoint = server.local_endpoint().clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(server.run(stop_rx));
        (endpoint, stop_tx, task)
    }

    #[tokio::test]
    async fn test_client_receives_table_then_full_update() {
        // Arrange
        let registry = registry();
        registry.apply_update(&move_to(0, 1.5, 1000)).unwrap();
        let (endpoint, _stop, _task) = start_server(registry, ServerOptions::default()).await;

        // Act
        let mut client = ClientSession::connect(&endpoint, "test", PROTOCOL_VERSION).await.unwrap();
        let update = time::timeout(WAIT, client.next_update()).await.unwrap().unwrap();

        // Assert
        assert_eq!(client.devices().len(), 2);
        assert_eq!(client.info().peer_name, "trackrelay");
        assert_eq!(update.devices.len(), 2);
        assert_eq!(update.devices[0].pose.unwrap().position.x, 1.5);
        assert_eq!(update.devices[0].time_stamp, Some(1000));
        assert_eq!(update.devices[1], DeviceUpdate::invalid(1, 0));
    }

    #[tokio::test]
    async fn test_later_changes_arrive_as_deltas() {
        // Arrange
        let registry = registry();
        let (endpoint, _stop, _task) =
            start_server(Arc::clone(&registry), ServerOptions::default()).await;
        let mut client = ClientSession::connect(&endpoint, "test", PROTOCOL_VERSION).await.unwrap();
        time::timeout(WAIT, client.next_update()).await.unwrap().unwrap();

        // Act
        registry.apply_update(&move_to(1, 4.0, 2000)).unwrap();
        let update = time::timeout(WAIT, client.next_update()).await.unwrap().unwrap();

        // Assert
        assert_eq!(update.devices.len(), 1);
        assert_eq!(update.devices[0].device, 1);
        assert_eq!(update.devices[0].pose.unwrap().position.x, 4.0);
    }

    #[tokio::test]
    async fn test_old_client_gets_only_valid_devices() {
        // Arrange: a version 2 session has no validity flag
        let registry = registry();
        registry.apply_update(&move_to(1, 2.0, 10)).unwrap();
        let (endpoint, _stop, _task) = start_server(registry, ServerOptions::default()).await;

        // Act
        let mut client = ClientSession::connect(&endpoint, "old", 2).await.unwrap();
        let update = time::timeout(WAIT, client.next_update()).await.unwrap().unwrap();

        // Assert
        assert_eq!(client.info().version, 2);
        let indices: Vec<u16> = update.devices.iter().map(|d| d.device).collect();
        assert_eq!(indices, vec![1]);
        assert_eq!(update.devices[0].valid, None);
    }

    #[tokio::test]
    async fn test_device_set_change_ends_session() {
        // Arrange
        let registry = registry();
        let (endpoint, _stop, _task) =
            start_server(Arc::clone(&registry), ServerOptions::default()).await;
        let mut client = ClientSession::connect(&endpoint, "test", PROTOCOL_VERSION).await.unwrap();
        time::timeout(WAIT, client.next_update()).await.unwrap().unwrap();

        // Act
        let late = DeviceDescriptor::new("late", TrackingType::None);
        registry.register_devices(DeviceOwner::Local, &[late]).unwrap();
        let result = time::timeout(WAIT, client.next_update()).await.unwrap();

        // Assert
        assert!(matches!(
            result,
            Err(SessionError::Disconnected(DisconnectReason::DeviceSetChanged))
        ));

        // A fresh session sees the new table.
        let client = ClientSession::connect(&endpoint, "test", PROTOCOL_VERSION).await.unwrap();
        assert_eq!(client.devices().len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_clients() {
        // Arrange
        let (endpoint, stop, task) = start_server(registry(), ServerOptions::default()).await;
        let mut client = ClientSession::connect(&endpoint, "test", PROTOCOL_VERSION).await.unwrap();
        time::timeout(WAIT, client.next_update()).await.unwrap().unwrap();

        // Act
        stop.send_replace(true);
        let result = time::timeout(WAIT, client.next_update()).await.unwrap();

        // Assert
        assert!(matches!(result, Err(SessionError::Disconnected(DisconnectReason::Shutdown))));
        time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    fn assert_send<F: std::future::Future + Send>(future: F) -> F {
        future
    }

    #[tokio::test]
    async fn test_client_session_future_is_send_and_ends_on_stalled_handshake() {
        // Arrange: a peer that connects but never negotiates byte order
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
        let endpoint = listener.local_endpoint().clone();
        let _peer = tokio::spawn(async move { endpoint.connect().await });
        let (stream, peer) = listener.accept().await.unwrap();
        let options = ServerOptions {
            handshake_timeout: Duration::from_millis(100),
            ..ServerOptions::default()
        };
        let (_stop, stop_rx) = watch::channel(false);

        // Act: sessions are spawned onto a JoinSet, so the future must be Send
        let session =
            assert_send(serve_client(stream, peer, registry(), Arc::new(options), stop_rx));

        // Assert
        time::timeout(WAIT, session).await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_pings_are_answered_by_the_client() {
        // Arrange: a short keepalive, so several peer timeouts pass during the test
        let options = ServerOptions {
            keepalive_interval: Duration::from_millis(20),
            ..ServerOptions::default()
        };
        let registry = registry();
        let (endpoint, _stop, _task) = start_server(Arc::clone(&registry), options).await;
        let mut client = ClientSession::connect(&endpoint, "test", PROTOCOL_VERSION).await.unwrap();
        time::timeout(WAIT, client.next_update()).await.unwrap().unwrap();

        // Act: the client answers pings while it waits
        let waiting = tokio::spawn(async move {
            let update = client.next_update().await;
            (client, update)
        });
        time::sleep(Duration::from_millis(300)).await;
        registry.apply_update(&move_to(0, 3.0, 5)).unwrap();
        let (_client, update) = time::timeout(WAIT, waiting).await.unwrap().unwrap();

        // Assert
        assert_eq!(update.unwrap().devices[0].time_stamp, Some(5));
    }

    #[tokio::test]
    async fn test_silent_peer_is_dropped_after_handshake_timeout() {
        // Arrange
        let options = ServerOptions {
            handshake_timeout: Duration::from_millis(50),
            ..ServerOptions::default()
        };
        let (endpoint, _stop, _task) = start_server(registry(), options).await;

        // Act: connect at the socket level but never negotiate
        let mut stream = endpoint.connect().await.unwrap();
        let mut buf = [0u8; 64];
        let read = time::timeout(WAIT, async {
            use tokio::io::AsyncReadExt;
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;

        // Assert: the server closed the socket
        assert!(read.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let endpoint = Endpoint::tcp("127.0.0.1", 0);
        let first = DeviceServer::bind(&endpoint, registry(), ServerOptions::default())
            .await
            .unwrap();

        let second =
            DeviceServer::bind(first.local_endpoint(), registry(), ServerOptions::default()).await;

        assert!(matches!(second, Err(ServerError::Bind { .. })));
    }
}
