//! Binary codec for encoding and decoding trackrelay protocol messages.
//!
//! Wire format:
//! ```text
//! [msg_type:1][flags:1][reserved:2][payload_len:4][payload:N]
//! ```
//! Total header size: 8 bytes.  Multi-byte scalars are written in the
//! *sender's* byte order; the receiver decodes them in the order negotiated by
//! the transport channel (see [`crate::transport`]).
//!
//! Payload layouts (`str` = `[len:u16][utf8]`):
//!
//! ```text
//! HELLO         [protocol_version:u32][client_name:str]
//! SERVER_HELLO  [server_version:u32][session_version:u32][capabilities:u32]
//!               [server_name:str][device_count:u16]{descriptor}
//!   descriptor  [name:str][tracking:u8][buttons:u16][valuator_count:u16][kind:u8]*
//! STATE_UPDATE  [device_count:u16]{device_update}
//!   device_update
//!               [device:u16][fields:u8]
//!               POSE      → [px py pz:f32][qx qy qz qw:f32]
//!               VELOCITY  → [lx ly lz:f32][ax ay az:f32]   (VELOCITIES only)
//!               BUTTONS   → [count:u16][packed bits, LSB first]
//!               VALUATORS → [count:u16][value:f32]*
//!               [time_stamp:u64]                          (TIME_STAMPS only)
//!               [valid:u8]                                (VALIDITY only)
//! PING / PONG   [token:u64]
//! DISCONNECT    [reason:u8]
//! ```
//!
//! Decoding works on a fully received payload and produces an owned
//! [`Message`]; nothing is handed to the caller until the whole payload has
//! parsed, and trailing bytes are rejected.

use thiserror::Error;

use crate::domain::device::{
    DeviceDescriptor, Pose, Quat, TrackingType, ValuatorKind, Vec3, Velocity,
};
use crate::protocol::messages::{
    fields, DeviceUpdate, DisconnectReason, HelloMessage, Message, MessageType,
    ServerHelloMessage, StateUpdate, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
use crate::protocol::version::Capabilities;
use crate::transport::{ByteOrder, Scalar};

/// Errors that can occur during message encoding, decoding or validation.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The payload ended before a field could be read.
    #[error("truncated {context}: need {needed} bytes, got {available}")]
    Truncated {
        context: &'static str,
        needed: usize,
        available: usize,
    },

    /// The message type byte in the header is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// A message arrived that is not valid at this point of the session.
    #[error("unexpected message: expected {expected:?}, got {received:?}")]
    UnexpectedMessage {
        expected: MessageType,
        received: MessageType,
    },

    /// The negotiated version is older than this build supports.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// The peer's handshake does not agree with the local negotiation.
    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    /// The header declares a payload larger than [`MAX_PAYLOAD_SIZE`].
    #[error("payload of {0} bytes exceeds the 1 MiB limit")]
    PayloadTooLarge(usize),

    /// A device update used field bits this codec does not know.
    #[error("unknown device update field bits: 0x{0:02X}")]
    UnknownFieldBits(u8),

    /// A device update carried a field the session's version does not allow.
    #[error("field {0} not negotiated for this session")]
    FieldNotNegotiated(&'static str),

    /// The payload could not be parsed (field value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A device index is outside the session's descriptor table.
    #[error("device index {index} out of range (table has {count} devices)")]
    DeviceIndexOutOfRange { index: usize, count: usize },

    /// A button or valuator array does not match the device's descriptor.
    #[error("device {device}: {what} count {received} does not match descriptor ({expected})")]
    CountMismatch {
        device: usize,
        what: &'static str,
        expected: usize,
        received: usize,
    },

    /// A pose was sent for a device whose descriptor says it is untracked.
    #[error("device {device} is not tracked but received a pose")]
    PoseNotTracked { device: usize },
}

// ── Frame header ──────────────────────────────────────────────────────────────

/// The decoded 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Validates raw header fields read off the wire.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownMessageType`] or [`ProtocolError::PayloadTooLarge`].
    pub fn parse(type_byte: u8, payload_len: u32) -> Result<Self, ProtocolError> {
        let message_type = MessageType::try_from(type_byte)
            .map_err(|_| ProtocolError::UnknownMessageType(type_byte))?;
        let payload_len = payload_len as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            message_type,
            payload_len,
        })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `msg` into a complete frame (header + payload) in byte order `order`.
///
/// # Errors
///
/// Returns [`ProtocolError`] if a count does not fit its wire field or the
/// payload exceeds [`MAX_PAYLOAD_SIZE`].
///
/// # Examples
///
/// ```rust
/// use trackrelay_core::protocol::{decode_frame, encode_frame, Capabilities, Message};
/// use trackrelay_core::transport::ByteOrder;
///
/// let caps = Capabilities::for_version(4);
/// let bytes = encode_frame(&Message::Ping(42), caps, ByteOrder::Big).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes, caps, ByteOrder::Big).unwrap();
/// assert_eq!(decoded, Message::Ping(42));
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(
    msg: &Message,
    caps: Capabilities,
    order: ByteOrder,
) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(msg, caps, order)?;

    let mut w = WireWriter::with_capacity(order, HEADER_SIZE + payload.len());
    w.put(msg.message_type() as u8);
    w.put(0u8); // flags
    w.put(0u16); // reserved
    w.put(payload.len() as u32);
    w.buf.extend_from_slice(&payload);
    Ok(w.buf)
}

/// Encodes only the payload of `msg`.
pub fn encode_payload(
    msg: &Message,
    caps: Capabilities,
    order: ByteOrder,
) -> Result<Vec<u8>, ProtocolError> {
    let mut w = WireWriter::new(order);
    match msg {
        Message::Hello(m) => encode_hello(&mut w, m)?,
        Message::ServerHello(m) => encode_server_hello(&mut w, m)?,
        Message::StateUpdate(m) => encode_state_update(&mut w, m, caps)?,
        Message::Ping(token) | Message::Pong(token) => w.put(*token),
        Message::Disconnect { reason } => w.put(*reason as u8),
    }
    if w.buf.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(w.buf.len()));
    }
    Ok(w.buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the message and the number of bytes consumed.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are truncated or malformed.
pub fn decode_frame(
    bytes: &[u8],
    caps: Capabilities,
    order: ByteOrder,
) -> Result<(Message, usize), ProtocolError> {
    let mut r = WireReader::new(bytes, order, "frame header");
    let type_byte: u8 = r.take()?;
    let _flags: u8 = r.take()?;
    let _reserved: u16 = r.take()?;
    let payload_len: u32 = r.take()?;
    let header = FrameHeader::parse(type_byte, payload_len)?;

    let payload = r.take_bytes(header.payload_len)?;
    let msg = decode_payload(header.message_type, payload, caps, order)?;
    Ok((msg, HEADER_SIZE + header.payload_len))
}

/// Decodes a complete payload of type `msg_type`.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the payload is truncated, malformed, has
/// trailing bytes, or uses fields `caps` does not allow.
pub fn decode_payload(
    msg_type: MessageType,
    payload: &[u8],
    caps: Capabilities,
    order: ByteOrder,
) -> Result<Message, ProtocolError> {
    let msg = match msg_type {
        MessageType::Hello => {
            let mut r = WireReader::new(payload, order, "Hello");
            let m = decode_hello(&mut r)?;
            r.finish()?;
            Message::Hello(m)
        }
        MessageType::ServerHello => {
            let mut r = WireReader::new(payload, order, "ServerHello");
            let m = decode_server_hello(&mut r)?;
            r.finish()?;
            Message::ServerHello(m)
        }
        MessageType::StateUpdate => {
            let mut r = WireReader::new(payload, order, "StateUpdate");
            let m = decode_state_update(&mut r, caps)?;
            r.finish()?;
            Message::StateUpdate(m)
        }
        MessageType::Ping => {
            let mut r = WireReader::new(payload, order, "Ping");
            let token = r.take()?;
            r.finish()?;
            Message::Ping(token)
        }
        MessageType::Pong => {
            let mut r = WireReader::new(payload, order, "Pong");
            let token = r.take()?;
            r.finish()?;
            Message::Pong(token)
        }
        MessageType::Disconnect => {
            let mut r = WireReader::new(payload, order, "Disconnect");
            let code: u8 = r.take()?;
            r.finish()?;
            let reason = DisconnectReason::try_from(code).map_err(|_| {
                ProtocolError::MalformedPayload(format!("unknown disconnect reason: {code}"))
            })?;
            Message::Disconnect { reason }
        }
    };
    Ok(msg)
}

// ── Per-message encode helpers ────────────────────────────────────────────────

fn encode_hello(w: &mut WireWriter, m: &HelloMessage) -> Result<(), ProtocolError> {
    w.put(m.protocol_version);
    w.put_str(&m.client_name)
}

fn encode_server_hello(w: &mut WireWriter, m: &ServerHelloMessage) -> Result<(), ProtocolError> {
    w.put(m.server_version);
    w.put(m.session_version);
    w.put(m.capabilities.bits());
    w.put_str(&m.server_name)?;
    w.put_count(m.devices.len(), "device")?;
    for descriptor in &m.devices {
        encode_descriptor(w, descriptor)?;
    }
    Ok(())
}

fn encode_descriptor(w: &mut WireWriter, d: &DeviceDescriptor) -> Result<(), ProtocolError> {
    w.put_str(&d.name)?;
    w.put(d.tracking as u8);
    w.put(d.buttons);
    w.put_count(d.valuators.len(), "valuator")?;
    for kind in &d.valuators {
        w.put(*kind as u8);
    }
    Ok(())
}

fn encode_state_update(
    w: &mut WireWriter,
    m: &StateUpdate,
    caps: Capabilities,
) -> Result<(), ProtocolError> {
    w.put_count(m.devices.len(), "device")?;
    for update in &m.devices {
        encode_device_update(w, update, caps)?;
    }
    Ok(())
}

fn encode_device_update(
    w: &mut WireWriter,
    u: &DeviceUpdate,
    caps: Capabilities,
) -> Result<(), ProtocolError> {
    let velocity = u.velocity.filter(|_| caps.has_velocities());

    let mut flags = 0u8;
    if u.pose.is_some() {
        flags |= fields::POSE;
    }
    if velocity.is_some() {
        flags |= fields::VELOCITY;
    }
    if u.buttons.is_some() {
        flags |= fields::BUTTONS;
    }
    if u.valuators.is_some() {
        flags |= fields::VALUATORS;
    }

    w.put(u.device);
    w.put(flags);
    if let Some(pose) = &u.pose {
        w.put_vec3(pose.position);
        let q = pose.orientation;
        w.put_all(&[q.x, q.y, q.z, q.w]);
    }
    if let Some(velocity) = &velocity {
        w.put_vec3(velocity.linear);
        w.put_vec3(velocity.angular);
    }
    if let Some(buttons) = &u.buttons {
        w.put_count(buttons.len(), "button")?;
        w.buf.extend_from_slice(&pack_bits(buttons));
    }
    if let Some(valuators) = &u.valuators {
        w.put_count(valuators.len(), "valuator")?;
        w.put_all(valuators);
    }
    if caps.has_time_stamps() {
        w.put(u.time_stamp.unwrap_or(0));
    }
    if caps.has_validity() {
        w.put(u8::from(u.valid.unwrap_or(true)));
    }
    Ok(())
}

// ── Per-message decode helpers ────────────────────────────────────────────────

fn decode_hello(r: &mut WireReader<'_>) -> Result<HelloMessage, ProtocolError> {
    let protocol_version = r.take()?;
    let client_name = r.take_str()?;
    Ok(HelloMessage {
        protocol_version,
        client_name,
    })
}

fn decode_server_hello(r: &mut WireReader<'_>) -> Result<ServerHelloMessage, ProtocolError> {
    let server_version = r.take()?;
    let session_version = r.take()?;
    let capabilities = Capabilities::from_wire(r.take()?);
    let server_name = r.take_str()?;
    let count: u16 = r.take()?;
    let mut devices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        devices.push(decode_descriptor(r)?);
    }
    Ok(ServerHelloMessage {
        server_version,
        session_version,
        capabilities,
        server_name,
        devices,
    })
}

fn decode_descriptor(r: &mut WireReader<'_>) -> Result<DeviceDescriptor, ProtocolError> {
    let name = r.take_str()?;
    let tracking_byte: u8 = r.take()?;
    let tracking = TrackingType::try_from(tracking_byte).map_err(|_| {
        ProtocolError::MalformedPayload(format!("unknown tracking type: {tracking_byte}"))
    })?;
    let buttons = r.take()?;
    let valuator_count: u16 = r.take()?;
    let valuators = r
        .take_bytes(valuator_count as usize)?
        .iter()
        .map(|&kind| {
            ValuatorKind::try_from(kind).map_err(|_| {
                ProtocolError::MalformedPayload(format!("unknown valuator kind: {kind}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DeviceDescriptor {
        name,
        tracking,
        buttons,
        valuators,
    })
}

fn decode_state_update(
    r: &mut WireReader<'_>,
    caps: Capabilities,
) -> Result<StateUpdate, ProtocolError> {
    let count: u16 = r.take()?;
    // Each device update is at least 3 bytes; don't trust the count for allocation.
    let mut devices = Vec::with_capacity((count as usize).min(r.remaining() / 3));
    for _ in 0..count {
        devices.push(decode_device_update(r, caps)?);
    }
    Ok(StateUpdate { devices })
}

fn decode_device_update(
    r: &mut WireReader<'_>,
    caps: Capabilities,
) -> Result<DeviceUpdate, ProtocolError> {
    let device = r.take()?;
    let flags: u8 = r.take()?;
    if flags & !fields::ALL != 0 {
        return Err(ProtocolError::UnknownFieldBits(flags & !fields::ALL));
    }
    if flags & fields::VELOCITY != 0 && !caps.has_velocities() {
        return Err(ProtocolError::FieldNotNegotiated("velocity"));
    }

    let pose = if flags & fields::POSE != 0 {
        let position = r.take_vec3()?;
        let [x, y, z, w] = r.take_array::<4>()?;
        Some(Pose::new(position, Quat::new(x, y, z, w)))
    } else {
        None
    };
    let velocity = if flags & fields::VELOCITY != 0 {
        Some(Velocity {
            linear: r.take_vec3()?,
            angular: r.take_vec3()?,
        })
    } else {
        None
    };
    let buttons = if flags & fields::BUTTONS != 0 {
        let count: u16 = r.take()?;
        let packed = r.take_bytes((count as usize).div_ceil(8))?;
        Some(unpack_bits(packed, count as usize))
    } else {
        None
    };
    let valuators = if flags & fields::VALUATORS != 0 {
        let count: u16 = r.take()?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(r.take::<f32>()?);
        }
        Some(values)
    } else {
        None
    };
    let time_stamp = if caps.has_time_stamps() { Some(r.take()?) } else { None };
    let valid = if caps.has_validity() {
        Some(r.take::<u8>()? != 0)
    } else {
        None
    };

    Ok(DeviceUpdate {
        device,
        pose,
        velocity,
        buttons,
        valuators,
        time_stamp,
        valid,
    })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

/// Packs booleans into bytes, least significant bit first.
fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (i, &on) in bits.iter().enumerate() {
        if on {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

fn unpack_bits(packed: &[u8], count: usize) -> Vec<bool> {
    (0..count).map(|i| packed[i / 8] & (1 << (i % 8)) != 0).collect()
}

/// Appends scalars in a fixed byte order.
struct WireWriter {
    order: ByteOrder,
    buf: Vec<u8>,
}

impl WireWriter {
    fn new(order: ByteOrder) -> Self {
        Self::with_capacity(order, 64)
    }

    fn with_capacity(order: ByteOrder, capacity: usize) -> Self {
        Self {
            order,
            buf: Vec::with_capacity(capacity),
        }
    }

    fn put<T: Scalar>(&mut self, value: T) {
        value.write_to(self.order, &mut self.buf);
    }

    fn put_all<T: Scalar>(&mut self, values: &[T]) {
        for value in values {
            self.put(*value);
        }
    }

    fn put_vec3(&mut self, v: Vec3) {
        self.put_all(&[v.x, v.y, v.z]);
    }

    fn put_count(&mut self, count: usize, what: &str) -> Result<(), ProtocolError> {
        let count = u16::try_from(count).map_err(|_| {
            ProtocolError::MalformedPayload(format!("{what} count {count} exceeds {}", u16::MAX))
        })?;
        self.put(count);
        Ok(())
    }

    /// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
    fn put_str(&mut self, s: &str) -> Result<(), ProtocolError> {
        self.put_count(s.len(), "string byte")?;
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// Consumes scalars from a payload in a fixed byte order.
struct WireReader<'a> {
    order: ByteOrder,
    buf: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8], order: ByteOrder, context: &'static str) -> Self {
        Self {
            order,
            buf,
            pos: 0,
            context,
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(ProtocolError::Truncated {
                context: self.context,
                needed: end,
                available: self.buf.len(),
            });
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take<T: Scalar>(&mut self) -> Result<T, ProtocolError> {
        let order = self.order;
        let bytes = self.take_bytes(T::SIZE)?;
        Ok(T::read_from(order, bytes))
    }

    fn take_array<const N: usize>(&mut self) -> Result<[f32; N], ProtocolError> {
        let mut out = [0f32; N];
        for slot in &mut out {
            *slot = self.take()?;
        }
        Ok(out)
    }

    fn take_vec3(&mut self) -> Result<Vec3, ProtocolError> {
        let [x, y, z] = self.take_array::<3>()?;
        Ok(Vec3::new(x, y, z))
    }

    /// Reads a 2-byte length prefix and then that many UTF-8 bytes.
    fn take_str(&mut self) -> Result<String, ProtocolError> {
        let len: u16 = self.take()?;
        let bytes = self.take_bytes(len as usize)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::MalformedPayload(format!(
                "{}: {} trailing bytes",
                self.context,
                self.remaining()
            )));
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
