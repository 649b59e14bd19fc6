//! # trackrelay-core
//!
//! Shared library for trackrelay containing the transport channel, the
//! versioned wire protocol and the device state tables.
//!
//! This crate is used by both the device server (including its relay links)
//! and by device clients.
//!
//! # Architecture overview (for beginners)
//!
//! trackrelay replicates the live state of tracking devices (6-DOF trackers,
//! buttons, analog valuators) from a device server to client applications.
//! Servers can be daisy-chained: a server may *relay* devices attached to
//! another server and re-export them as if they were local.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`transport`** – A byte stream (TCP or Unix-domain socket) that
//!   negotiates endianness once at connect time and then offers typed scalar
//!   reads and writes that swap bytes when the two ends disagree.
//!
//! - **`protocol`** – How device state travels over that stream: an 8-byte
//!   frame header, a fixed catalogue of messages, and a version handshake that
//!   lets older and newer builds talk by dropping fields one side lacks.
//!
//! - **`domain`** – Device descriptors and state, the client-side
//!   `DeviceStateTable` and the server-side `DeviceRegistry`.

pub mod domain;
pub mod protocol;
pub mod transport;

// Re-export the most-used types at the crate root so callers can write
// `trackrelay_core::DeviceRegistry` instead of the full module path.
pub use domain::device::{
    local_time_micros, DeviceDescriptor, DeviceState, Pose, Quat, TrackingType, ValuatorKind, Vec3,
    Velocity,
};
pub use domain::registry::{
    DeviceOwner, DeviceRegistry, LocalRegistry, RegisteredDevice, RegistryError, RegistrySnapshot,
};
pub use domain::snapshot::{ApplyOutcome, DeviceStateTable};
pub use protocol::codec::ProtocolError;
pub use protocol::messages::{DeviceUpdate, DisconnectReason, Message, StateUpdate};
pub use protocol::session::{ClientSession, ServerSession, SessionError, SessionInfo};
pub use protocol::version::Capabilities;
pub use transport::{ByteOrder, Channel, ChannelError, Endpoint, Listener, Stream};
