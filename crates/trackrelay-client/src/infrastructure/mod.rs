//! Infrastructure layer for the client application.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `trackrelay_core`, but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`network`** – Reconnecting device client: connects to a server,
//!   completes the handshake, mirrors state updates into a state table and
//!   marks every device invalid when the session is lost.

pub mod network;
