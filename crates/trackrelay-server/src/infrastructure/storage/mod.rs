//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module handles:
//!
//! - Reading the TOML configuration file from `--config` or the
//!   platform-appropriate directory.
//! - Providing defaults when the default file does not exist yet.
//! - Turning file entries into the runtime settings of relay links and local
//!   devices.

pub mod config;
