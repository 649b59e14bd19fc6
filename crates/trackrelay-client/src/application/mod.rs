//! Application layer use cases for the client application.
//!
//! # What use cases does the client have?
//!
//! - **`monitor`** – Renders the mirrored device state as text, one line
//!   per device, optionally filtered by device name.  The
//!   `trackrelay-monitor` binary prints these lines on every update.

pub mod monitor;
