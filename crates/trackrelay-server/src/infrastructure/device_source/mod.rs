//! Local device sources for the server.
//!
//! A device source stands in for driver code: it owns a fixed descriptor
//! table and produces readings for those devices on its own schedule.
//! Readings are [`DeviceUpdate`]s indexed by the source's own table
//! (`0..descriptors().len()`); the [`LocalDevicePump`] remaps them to
//! registry slots.
//!
//! # Testability
//!
//! The [`DeviceSource`] trait lets tests inject readings through
//! [`mock::MockDeviceSource`] without any timer or hardware.
//!
//! [`LocalDevicePump`]: crate::application::pump_local::LocalDevicePump

use tokio::sync::mpsc;
use trackrelay_core::{DeviceDescriptor, DeviceUpdate};

pub mod mock;
pub mod simulated;

/// Error type for device source operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("device source is already running")]
    AlreadyStarted,
    #[error("device source failed to start: {0}")]
    StartFailed(String),
}

/// Trait abstracting a producer of local device readings.
pub trait DeviceSource: Send + Sync {
    /// The devices this source reports on, in source index order.
    fn descriptors(&self) -> Vec<DeviceDescriptor>;

    /// Starts the source and returns a receiver for its readings.
    ///
    /// The receiver yields `None` once the source has stopped.
    fn start(&self) -> Result<mpsc::UnboundedReceiver<DeviceUpdate>, SourceError>;

    /// Stops the source; the receiver returned by `start` then closes.
    fn stop(&self);
}
