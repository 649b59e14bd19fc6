//! Protocol sessions: the version handshake plus framed message I/O.
//!
//! # Handshake (for beginners)
//!
//! After the transport has negotiated endianness, the two ends agree on a
//! protocol version:
//!
//! ```text
//!  client                                   server
//!    │ ── HELLO { my highest version } ──────▶ │
//!    │                                         │ session = min(client, server)
//!    │ ◀── SERVER_HELLO { server highest,  ──  │
//!    │       session, capabilities, devices }  │
//!    │                                         │
//!    │ ◀════════ STATE_UPDATE / PING ═════════ │
//! ```
//!
//! If the minimum is older than [`MIN_PROTOCOL_VERSION`] the server answers
//! with `DISCONNECT { VersionMismatch }` instead.  The client re-derives the
//! session version and capability flags on its own and refuses a
//! `SERVER_HELLO` that disagrees, so both ends always decode with the same
//! [`Capabilities`].
//!
//! # Cancellation
//!
//! A read that is cancelled part-way through a frame (for example because a
//! `tokio::select!` picked another branch) leaves the stream misaligned.
//! Every caller in this workspace therefore treats a cancelled read as the end
//! of the session, or reads from a dedicated task that is never cancelled.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::{debug, trace};

use crate::domain::device::DeviceDescriptor;
use crate::protocol::codec::{decode_payload, encode_frame, FrameHeader, ProtocolError};
use crate::protocol::messages::{
    DisconnectReason, HelloMessage, Message, MessageType, ServerHelloMessage, StateUpdate,
    MIN_PROTOCOL_VERSION,
};
use crate::protocol::version::{negotiate_version, Capabilities};
use crate::transport::{Channel, ChannelError, ChannelReader, ChannelWriter, Endpoint, Stream};

/// Errors that end a protocol session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Channel(#[from] ChannelError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No traffic arrived within the allowed interval.
    #[error("no traffic within {0:?}")]
    Timeout(Duration),

    /// The peer sent `DISCONNECT`.
    #[error("peer disconnected: {0}")]
    Disconnected(DisconnectReason),
}

impl SessionError {
    /// The reason to report to the peer when this error ends a session.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            SessionError::Protocol(
                ProtocolError::UnsupportedVersion(_) | ProtocolError::VersionMismatch(_),
            ) => DisconnectReason::VersionMismatch,
            SessionError::Protocol(_) => DisconnectReason::ProtocolViolation,
            SessionError::Timeout(_) => DisconnectReason::Timeout,
            SessionError::Channel(_) | SessionError::Disconnected(_) => DisconnectReason::Shutdown,
        }
    }
}

/// The immutable result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub version: u32,
    pub capabilities: Capabilities,
    pub peer_name: String,
}

impl SessionInfo {
    fn new(version: u32, peer_name: String) -> Self {
        Self {
            version,
            capabilities: Capabilities::for_version(version),
            peer_name,
        }
    }
}

// ── Framed I/O ────────────────────────────────────────────────────────────────

/// Reads whole frames off a channel and decodes them.
#[derive(Debug)]
pub struct MessageReader<R> {
    channel: ChannelReader<R>,
    caps: Capabilities,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(channel: ChannelReader<R>, caps: Capabilities) -> Self {
        Self { channel, caps }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Reads the next frame in full, then decodes it.
    ///
    /// # Errors
    ///
    /// [`SessionError::Channel`] on transport failure or EOF,
    /// [`SessionError::Protocol`] if the frame is malformed.
    pub async fn read_message(&mut self) -> Result<Message, SessionError> {
        let type_byte: u8 = self.channel.read_scalar().await?;
        let _flags: u8 = self.channel.read_scalar().await?;
        let _reserved: u16 = self.channel.read_scalar().await?;
        let payload_len: u32 = self.channel.read_scalar().await?;
        let header = FrameHeader::parse(type_byte, payload_len)?;

        let payload = self.channel.read_bytes(header.payload_len).await?;
        let order = self.channel.wire_order();
        let msg = decode_payload(header.message_type, &payload, self.caps, order)?;
        trace!(message_type = ?header.message_type, payload_len, "frame received");
        Ok(msg)
    }
}

/// Encodes messages and writes one flushed frame per message.
#[derive(Debug)]
pub struct MessageWriter<W> {
    channel: ChannelWriter<W>,
    caps: Capabilities,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(channel: ChannelWriter<W>, caps: Capabilities) -> Self {
        Self { channel, caps }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Encodes `msg` at the session's capabilities and flushes it.
    pub async fn write_message(&mut self, msg: &Message) -> Result<(), SessionError> {
        let frame = encode_frame(msg, self.caps, self.channel.wire_order())?;
        self.channel.write_bytes(&frame).await?;
        self.channel.flush().await?;
        trace!(message_type = ?msg.message_type(), len = frame.len(), "frame sent");
        Ok(())
    }

    /// Sends `DISCONNECT { reason }` and half-closes the write side.
    pub async fn disconnect(&mut self, reason: DisconnectReason) -> Result<(), SessionError> {
        self.write_message(&Message::Disconnect { reason }).await?;
        self.channel.shutdown().await?;
        Ok(())
    }
}

// ── Client side ───────────────────────────────────────────────────────────────

/// A client's view of an established session.
#[derive(Debug)]
pub struct ClientSession<S> {
    reader: MessageReader<ReadHalf<S>>,
    writer: MessageWriter<WriteHalf<S>>,
    info: SessionInfo,
    devices: Vec<DeviceDescriptor>,
}

impl ClientSession<Stream> {
    /// Connects, negotiates endianness and runs the client handshake.
    pub async fn connect(
        endpoint: &Endpoint,
        client_name: &str,
        max_version: u32,
    ) -> Result<Self, SessionError> {
        let channel = Channel::connect(endpoint).await?;
        Self::handshake(channel, client_name, max_version).await
    }
}

impl<S: AsyncRead + AsyncWrite> ClientSession<S> {
    /// Runs the client side of the version handshake on an established channel.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Disconnected`] if the server refuses the session.
    /// - [`ProtocolError::VersionMismatch`] if the server's session version or
    ///   capabilities disagree with `min(max_version, server_version)`.
    /// - [`ProtocolError::UnexpectedMessage`] for any other first message.
    pub async fn handshake(
        channel: Channel<S>,
        client_name: &str,
        max_version: u32,
    ) -> Result<Self, SessionError> {
        let (reader, writer) = channel.into_split();
        let mut reader = MessageReader::new(reader, Capabilities::none());
        let mut writer = MessageWriter::new(writer, Capabilities::none());

        writer
            .write_message(&Message::Hello(HelloMessage {
                protocol_version: max_version,
                client_name: client_name.to_string(),
            }))
            .await?;

        let hello = match reader.read_message().await? {
            Message::ServerHello(hello) => hello,
            Message::Disconnect { reason } => return Err(SessionError::Disconnected(reason)),
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: MessageType::ServerHello,
                    received: other.message_type(),
                }
                .into())
            }
        };

        let expected = negotiate_version(max_version, hello.server_version)?;
        if hello.session_version != expected {
            return Err(ProtocolError::VersionMismatch(format!(
                "server chose version {} but min({max_version}, {}) is {expected}",
                hello.session_version, hello.server_version
            ))
            .into());
        }
        let caps = Capabilities::for_version(expected);
        if hello.capabilities != caps {
            return Err(ProtocolError::VersionMismatch(format!(
                "server capabilities [{}] do not match version {expected} [{caps}]",
                hello.capabilities
            ))
            .into());
        }

        reader.caps = caps;
        writer.caps = caps;
        let info = SessionInfo::new(expected, hello.server_name);
        debug!(
            server = %info.peer_name,
            version = info.version,
            capabilities = %caps,
            devices = hello.devices.len(),
            "client handshake complete"
        );
        Ok(Self {
            reader,
            writer,
            info,
            devices: hello.devices,
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// The server's descriptor table, fixed for this session.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Waits for the next state update, answering keepalive pings on the way.
    ///
    /// # Errors
    ///
    /// Any [`SessionError`]; a server `DISCONNECT` surfaces as
    /// [`SessionError::Disconnected`].
    pub async fn next_update(&mut self) -> Result<StateUpdate, SessionError> {
        loop {
            let msg = self.reader.read_message().await?;
            if let Some(update) = self.dispatch(msg).await? {
                return Ok(update);
            }
        }
    }

    /// [`Self::next_update`] with `idle` as the longest allowed gap between
    /// two frames.  Keepalive pings count as traffic.
    ///
    /// # Errors
    ///
    /// [`SessionError::Timeout`] if a frame does not arrive in time; the
    /// session is unusable afterwards.
    pub async fn next_update_within(
        &mut self,
        idle: Duration,
    ) -> Result<StateUpdate, SessionError> {
        loop {
            let msg = tokio::time::timeout(idle, self.reader.read_message())
                .await
                .map_err(|_| SessionError::Timeout(idle))??;
            if let Some(update) = self.dispatch(msg).await? {
                return Ok(update);
            }
        }
    }

    async fn dispatch(&mut self, msg: Message) -> Result<Option<StateUpdate>, SessionError> {
        match msg {
            Message::StateUpdate(update) => Ok(Some(update)),
            Message::Ping(token) => {
                self.writer.write_message(&Message::Pong(token)).await?;
                Ok(None)
            }
            Message::Pong(_) => Ok(None),
            Message::Disconnect { reason } => Err(SessionError::Disconnected(reason)),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: MessageType::StateUpdate,
                received: other.message_type(),
            }
            .into()),
        }
    }

    /// Ends the session politely.
    pub async fn close(mut self, reason: DisconnectReason) -> Result<(), SessionError> {
        self.writer.disconnect(reason).await
    }
}

// ── Server side ───────────────────────────────────────────────────────────────

/// A server's view of an established session.
#[derive(Debug)]
pub struct ServerSession<S> {
    reader: MessageReader<ReadHalf<S>>,
    writer: MessageWriter<WriteHalf<S>>,
    info: SessionInfo,
}

impl<S: AsyncRead + AsyncWrite> ServerSession<S> {
    /// Runs the server side of the handshake and sends the descriptor table.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnsupportedVersion`] (after sending
    /// `DISCONNECT { VersionMismatch }`) if the client is too old, or
    /// [`ProtocolError::UnexpectedMessage`] if the first message is not `HELLO`.
    pub async fn accept(
        channel: Channel<S>,
        server_name: &str,
        max_version: u32,
        devices: &[DeviceDescriptor],
    ) -> Result<Self, SessionError> {
        let (reader, writer) = channel.into_split();
        let mut reader = MessageReader::new(reader, Capabilities::none());
        let mut writer = MessageWriter::new(writer, Capabilities::none());

        let hello = match reader.read_message().await? {
            Message::Hello(hello) => hello,
            Message::Disconnect { reason } => return Err(SessionError::Disconnected(reason)),
            other => {
                let _ = writer.disconnect(DisconnectReason::ProtocolViolation).await;
                return Err(ProtocolError::UnexpectedMessage {
                    expected: MessageType::Hello,
                    received: other.message_type(),
                }
                .into());
            }
        };

        let version = match negotiate_version(hello.protocol_version, max_version) {
            Ok(version) => version,
            Err(e) => {
                debug!(
                    client = %hello.client_name,
                    client_version = hello.protocol_version,
                    minimum = MIN_PROTOCOL_VERSION,
                    "rejecting client version"
                );
                let _ = writer.disconnect(DisconnectReason::VersionMismatch).await;
                return Err(e.into());
            }
        };

        let caps = Capabilities::for_version(version);
        writer
            .write_message(&Message::ServerHello(ServerHelloMessage {
                server_version: max_version,
                session_version: version,
                capabilities: caps,
                server_name: server_name.to_string(),
                devices: devices.to_vec(),
            }))
            .await?;

        reader.caps = caps;
        writer.caps = caps;
        let info = SessionInfo::new(version, hello.client_name);
        debug!(
            client = %info.peer_name,
            version,
            capabilities = %caps,
            "server handshake complete"
        );
        Ok(Self { reader, writer, info })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Splits the session so inbound messages can be drained by their own task.
    pub fn into_split(
        self,
    ) -> (MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>, SessionInfo) {
        (self.reader, self.writer, self.info)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::{Pose, TrackingType, Vec3};
    use crate::protocol::messages::{DeviceUpdate, PROTOCOL_VERSION};
    use crate::transport::ByteOrder;
    use tokio::io::{duplex, DuplexStream};

    fn devices() -> Vec<DeviceDescriptor> {
        vec![
            DeviceDescriptor::new("tracker0", TrackingType::PositionOrientation).with_buttons(2),
            DeviceDescriptor::new("tracker1", TrackingType::Position),
        ]
    }

    async fn channels(
        client: ByteOrder,
        server: ByteOrder,
    ) -> (Channel<DuplexStream>, Channel<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let (a, b) = tokio::join!(
            Channel::establish_with_order(a, client),
            Channel::establish_with_order(b, server)
        );
        (a.unwrap(), b.unwrap())
    }

    async fn handshake(
        client_version: u32,
        server_version: u32,
    ) -> (
        Result<ClientSession<DuplexStream>, SessionError>,
        Result<ServerSession<DuplexStream>, SessionError>,
    ) {
        let (c, s) = channels(ByteOrder::Little, ByteOrder::Big).await;
        let table = devices();
        tokio::join!(
            ClientSession::handshake(c, "client", client_version),
            ServerSession::accept(s, "server", server_version, &table)
        )
    }

    #[tokio::test]
    async fn test_handshake_negotiates_minimum_for_every_version_pair() {
        for client_version in MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION {
            for server_version in MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION {
                // Act
                let (client, server) = handshake(client_version, server_version).await;

                // Assert
                let client = client.expect("client handshake");
                let server = server.expect("server handshake");
                let expected = client_version.min(server_version);
                assert_eq!(client.info().version, expected);
                assert_eq!(server.info().version, expected);
                assert_eq!(client.info().capabilities, Capabilities::for_version(expected));
                assert_eq!(client.info().peer_name, "server");
                assert_eq!(server.info().peer_name, "client");
                assert_eq!(client.devices(), devices().as_slice());
            }
        }
    }

    #[tokio::test]
    async fn test_server_rejects_unsupported_client_version() {
        let (client, server) = handshake(0, PROTOCOL_VERSION).await;

        assert!(matches!(
            server,
            Err(SessionError::Protocol(ProtocolError::UnsupportedVersion(0)))
        ));
        assert!(matches!(
            client,
            Err(SessionError::Disconnected(DisconnectReason::VersionMismatch))
                | Err(SessionError::Protocol(ProtocolError::UnsupportedVersion(0)))
        ));
    }

    #[tokio::test]
    async fn test_client_rejects_server_that_picks_wrong_version() {
        // Arrange: a server that claims version 4 to a version-2 client
        let (c, s) = channels(ByteOrder::Big, ByteOrder::Big).await;
        let fake_server = tokio::spawn(async move {
            let (r, w) = s.into_split();
            let mut reader = MessageReader::new(r, Capabilities::none());
            let mut writer = MessageWriter::new(w, Capabilities::none());
            let _hello = reader.read_message().await.unwrap();
            writer
                .write_message(&Message::ServerHello(ServerHelloMessage {
                    server_version: 4,
                    session_version: 4,
                    capabilities: Capabilities::for_version(4),
                    server_name: "liar".into(),
                    devices: vec![],
                }))
                .await
                .unwrap();
        });

        // Act
        let result = ClientSession::handshake(c, "client", 2).await;

        // Assert
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::VersionMismatch(_)))
        ));
        fake_server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_rejects_non_hello_first_message() {
        let (c, s) = channels(ByteOrder::Little, ByteOrder::Little).await;
        let (_r, w) = c.into_split();
        let mut writer = MessageWriter::new(w, Capabilities::none());
        writer.write_message(&Message::Ping(1)).await.unwrap();

        let result = ServerSession::accept(s, "server", PROTOCOL_VERSION, &devices()).await;

        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::UnexpectedMessage {
                expected: MessageType::Hello,
                received: MessageType::Ping,
            }))
        ));
    }

    #[tokio::test]
    async fn test_next_update_answers_ping_and_returns_update() {
        // Arrange
        let (client, server) = handshake(PROTOCOL_VERSION, PROTOCOL_VERSION).await;
        let mut client = client.unwrap();
        let (mut reader, mut writer, _) = server.unwrap().into_split();
        let update = StateUpdate::new(vec![DeviceUpdate::new(0)
            .with_pose(Pose::at(Vec3::new(1.0, 2.0, 3.0)))
            .with_time_stamp(1000)
            .with_valid(true)]);

        // Act
        writer.write_message(&Message::Ping(77)).await.unwrap();
        writer.write_message(&Message::StateUpdate(update.clone())).await.unwrap();
        let received = client.next_update().await.unwrap();
        let pong = reader.read_message().await.unwrap();

        // Assert
        assert_eq!(received, update);
        assert_eq!(pong, Message::Pong(77));
    }

    #[tokio::test]
    async fn test_pings_keep_an_idle_session_alive() {
        // Arrange: pings every 20 ms, idle limit 200 ms, update after 300 ms
        let (client, server) = handshake(PROTOCOL_VERSION, PROTOCOL_VERSION).await;
        let mut client = client.unwrap();
        let (_reader, mut writer, _) = server.unwrap().into_split();
        let server = tokio::spawn(async move {
            for token in 0..15 {
                writer.write_message(&Message::Ping(token)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            writer
                .write_message(&Message::StateUpdate(StateUpdate::default()))
                .await
                .unwrap();
            writer
        });

        // Act
        let result = client.next_update_within(Duration::from_millis(200)).await;

        // Assert
        assert_eq!(result.unwrap(), StateUpdate::default());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (client, server) = handshake(PROTOCOL_VERSION, PROTOCOL_VERSION).await;
        let mut client = client.unwrap();
        let _server = server.unwrap();

        let result = client.next_update_within(Duration::from_millis(30)).await;

        assert!(matches!(result, Err(SessionError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_server_disconnect_surfaces_reason() {
        let (client, server) = handshake(3, 4).await;
        let mut client = client.unwrap();
        let (_reader, mut writer, _) = server.unwrap().into_split();

        writer.disconnect(DisconnectReason::DeviceSetChanged).await.unwrap();

        assert!(matches!(
            client.next_update().await,
            Err(SessionError::Disconnected(DisconnectReason::DeviceSetChanged))
        ));
    }

    #[tokio::test]
    async fn test_dropped_server_is_a_channel_error() {
        let (client, server) = handshake(4, 4).await;
        let mut client = client.unwrap();
        drop(server);

        assert!(matches!(client.next_update().await, Err(SessionError::Channel(_))));
    }

    #[tokio::test]
    async fn test_client_close_sends_disconnect() {
        let (client, server) = handshake(4, 4).await;
        let (mut reader, _writer, _) = server.unwrap().into_split();

        client.unwrap().close(DisconnectReason::Shutdown).await.unwrap();

        assert_eq!(
            reader.read_message().await.unwrap(),
            Message::Disconnect { reason: DisconnectReason::Shutdown }
        );
    }

    #[test]
    fn test_disconnect_reason_mapping() {
        assert_eq!(
            SessionError::Protocol(ProtocolError::UnsupportedVersion(0)).disconnect_reason(),
            DisconnectReason::VersionMismatch
        );
        assert_eq!(
            SessionError::Protocol(ProtocolError::UnknownFieldBits(0x40)).disconnect_reason(),
            DisconnectReason::ProtocolViolation
        );
        assert_eq!(
            SessionError::Timeout(Duration::from_secs(1)).disconnect_reason(),
            DisconnectReason::Timeout
        );
    }
}
