//! All trackrelay protocol message types.
//!
//! The byte layout of each payload is documented in [`super::codec`].  This
//! module only defines the typed, owned representation that the codec
//! produces and consumes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::device::{DeviceDescriptor, Pose, Velocity};
use crate::protocol::version::Capabilities;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Highest protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 4;

/// Lowest protocol version this build still accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single payload; larger frames are a protocol violation.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Bits of the per-device `fields` byte in a state update.
pub mod fields {
    pub const POSE: u8 = 0x01;
    pub const VELOCITY: u8 = 0x02;
    pub const BUTTONS: u8 = 0x04;
    pub const VALUATORS: u8 = 0x08;

    /// Every bit the codec understands.
    pub const ALL: u8 = POSE | VELOCITY | BUTTONS | VALUATORS;
}

// ── Message type codes ────────────────────────────────────────────────────────

/// The first byte of every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Handshake (0x01–0x0F)
    Hello = 0x01,
    ServerHello = 0x02,
    // State (0x10–0x1F)
    StateUpdate = 0x10,
    // Liveness (0x20–0x2F)
    Ping = 0x20,
    Pong = 0x21,
    // Teardown
    Disconnect = 0x7F,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::ServerHello),
            0x10 => Ok(MessageType::StateUpdate),
            0x20 => Ok(MessageType::Ping),
            0x21 => Ok(MessageType::Pong),
            0x7F => Ok(MessageType::Disconnect),
            _ => Err(()),
        }
    }
}

// ── Disconnect reasons ────────────────────────────────────────────────────────

/// Why a peer ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReason {
    Shutdown = 0,
    VersionMismatch = 1,
    ProtocolViolation = 2,
    /// The server's device table changed; reconnect to receive the new one.
    DeviceSetChanged = 3,
    Timeout = 4,
}

impl TryFrom<u8> for DisconnectReason {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(DisconnectReason::Shutdown),
            1 => Ok(DisconnectReason::VersionMismatch),
            2 => Ok(DisconnectReason::ProtocolViolation),
            3 => Ok(DisconnectReason::DeviceSetChanged),
            4 => Ok(DisconnectReason::Timeout),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::VersionMismatch => "version mismatch",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::DeviceSetChanged => "device set changed",
            DisconnectReason::Timeout => "timeout",
        };
        f.write_str(text)
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// HELLO (0x01): client → server, first message after endianness negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// The highest version the client supports.
    pub protocol_version: u32,
    pub client_name: String,
}

/// SERVER_HELLO (0x02): server → client, completes the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHelloMessage {
    /// The highest version the server supports.
    pub server_version: u32,
    /// `min(client, server)`; every later frame is encoded at this version.
    pub session_version: u32,
    pub capabilities: Capabilities,
    pub server_name: String,
    /// The descriptor table; index `i` on the wire refers to `devices[i]`.
    pub devices: Vec<DeviceDescriptor>,
}

/// New readings for one device.
///
/// `None` fields are not on the wire and leave the receiver's state untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub device: u16,
    pub pose: Option<Pose>,
    pub velocity: Option<Velocity>,
    pub buttons: Option<Vec<bool>>,
    pub valuators: Option<Vec<f32>>,
    /// Microseconds.  Sent when the session has time stamps.
    pub time_stamp: Option<u64>,
    /// Sent when the session has validity flags.
    pub valid: Option<bool>,
}

impl DeviceUpdate {
    pub fn new(device: u16) -> Self {
        Self {
            device,
            ..Self::default()
        }
    }

    /// An update that only marks `device` invalid as of `time_stamp`.
    pub fn invalid(device: u16, time_stamp: u64) -> Self {
        Self {
            device,
            time_stamp: Some(time_stamp),
            valid: Some(false),
            ..Self::default()
        }
    }

    pub fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = Some(pose);
        self
    }

    pub fn with_velocity(mut self, velocity: Velocity) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn with_buttons(mut self, buttons: Vec<bool>) -> Self {
        self.buttons = Some(buttons);
        self
    }

    pub fn with_valuators(mut self, valuators: Vec<f32>) -> Self {
        self.valuators = Some(valuators);
        self
    }

    pub fn with_time_stamp(mut self, time_stamp: u64) -> Self {
        self.time_stamp = Some(time_stamp);
        self
    }

    pub fn with_valid(mut self, valid: bool) -> Self {
        self.valid = Some(valid);
        self
    }

    /// The same update under a different device index.
    pub fn reindexed(&self, device: u16) -> Self {
        Self {
            device,
            ..self.clone()
        }
    }

    /// What this update looks like after an encode/decode at `caps`.
    ///
    /// Gated fields the session lacks disappear.  Gated fields the session
    /// has are always on the wire, so a missing time stamp arrives as `0`
    /// and a missing validity flag arrives as `true`.
    pub fn restricted_to(&self, caps: Capabilities) -> Self {
        Self {
            device: self.device,
            pose: self.pose,
            velocity: if caps.has_velocities() { self.velocity } else { None },
            buttons: self.buttons.clone(),
            valuators: self.valuators.clone(),
            time_stamp: caps.has_time_stamps().then(|| self.time_stamp.unwrap_or(0)),
            valid: caps.has_validity().then(|| self.valid.unwrap_or(true)),
        }
    }
}

/// STATE_UPDATE (0x10): server → client, readings for some or all devices.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateUpdate {
    pub devices: Vec<DeviceUpdate>,
}

impl StateUpdate {
    pub fn new(devices: Vec<DeviceUpdate>) -> Self {
        Self { devices }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// See [`DeviceUpdate::restricted_to`].
    pub fn restricted_to(&self, caps: Capabilities) -> Self {
        Self {
            devices: self.devices.iter().map(|d| d.restricted_to(caps)).collect(),
        }
    }
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Every message that can appear on a trackrelay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Hello(HelloMessage),
    ServerHello(ServerHelloMessage),
    StateUpdate(StateUpdate),
    /// Keepalive ping; the token is echoed back in the matching `Pong`.
    Ping(u64),
    Pong(u64),
    Disconnect { reason: DisconnectReason },
}

impl Message {
    /// Returns the [`MessageType`] for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::ServerHello(_) => MessageType::ServerHello,
            Message::StateUpdate(_) => MessageType::StateUpdate,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::Disconnect { .. } => MessageType::Disconnect,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
