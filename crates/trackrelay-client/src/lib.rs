//! trackrelay-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does trackrelay-client do? (for beginners)
//!
//! A *client* is any application that wants live tracking data: a renderer,
//! an interaction engine, a logger.  It does not talk to device drivers; it
//! connects to a device server and receives the state of every device the
//! server exports, local or relayed.
//!
//! The client library:
//!
//! 1. Connects to the server (TCP or Unix-domain socket) and negotiates
//!    byte order and protocol version.
//! 2. Builds a `DeviceStateTable` from the server's device descriptors.
//! 3. Applies every state update to that table and tells the application
//!    which devices changed.
//! 4. Marks every device invalid when the connection drops, then
//!    reconnects automatically.

/// Application layer: use cases for the client.
pub mod application;

/// Infrastructure layer: network I/O.
pub mod infrastructure;
