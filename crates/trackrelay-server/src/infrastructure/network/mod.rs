//! Network infrastructure for the device server.
//!
//! # Sub-modules
//!
//! - **`server`** – Binds a TCP or Unix-domain listener and runs one session
//!   task per client: endianness negotiation, version handshake, then a
//!   stream of state updates and keepalive pings until either side ends it.
//!
//! Outbound connections (relay links to upstream servers) live in
//! `application::relay`, since they only use the core crate's client session.

pub mod server;

pub use server::{DeviceServer, ServerError, ServerOptions};
