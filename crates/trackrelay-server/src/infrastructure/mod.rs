//! Infrastructure layer for the device server.
//!
//! Contains the OS-facing adapters: device sources (driver stand-ins), the
//! network listener, and file-system configuration storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `trackrelay_core`.  The application layer only reaches in here for the
//! `DeviceSource` trait, never for a concrete adapter.

pub mod device_source;
pub mod network;
pub mod storage;
