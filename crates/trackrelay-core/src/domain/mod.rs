//! Domain entities for trackrelay.
//!
//! This module holds the device model and the two state tables built on it.
//! It knows nothing about sockets; the only protocol types it touches are the
//! decoded [`crate::protocol::StateUpdate`] it applies and the
//! [`crate::protocol::ProtocolError`] it reports.
//!
//! # Where device state lives (for beginners)
//!
//! - A **client** mirrors one server.  It gets the server's descriptor table
//!   once at session start and keeps a [`snapshot::DeviceStateTable`] with one
//!   entry per descriptor.
//! - A **server** owns a [`registry::DeviceRegistry`].  Local device sources
//!   and relay links register devices there and push readings into it; every
//!   client session encodes outbound updates from it.
//!
//! Both tables validate an update completely before changing anything, so a
//! malformed message never leaves some devices updated and others not.

/// Descriptors, poses and per-device state.
pub mod device;
/// The server-side registry shared by sources, relay links and sessions.
pub mod registry;
/// The client-side per-session state table.
pub mod snapshot;
