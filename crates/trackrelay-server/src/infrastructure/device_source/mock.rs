//! Mock device source for unit testing.
//!
//! Allows tests to inject synthetic readings without a timer or driver.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::{self, UnboundedSender};
use trackrelay_core::{DeviceDescriptor, DeviceUpdate};

use super::{DeviceSource, SourceError};

/// A [`DeviceSource`] whose readings are pushed by the test.
pub struct MockDeviceSource {
    descriptors: Vec<DeviceDescriptor>,
    sender: Mutex<Option<UnboundedSender<DeviceUpdate>>>,
}

impl MockDeviceSource {
    pub fn new(descriptors: Vec<DeviceDescriptor>) -> Self {
        Self {
            descriptors,
            sender: Mutex::new(None),
        }
    }

    /// Injects a reading, as if produced by a driver.
    ///
    /// Returns `false` if the source is not running or nobody is listening.
    pub fn inject_update(&self, update: DeviceUpdate) -> bool {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(sender) => sender.send(update).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl DeviceSource for MockDeviceSource {
    fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.descriptors.clone()
    }

    fn start(&self) -> Result<mpsc::UnboundedReceiver<DeviceUpdate>, SourceError> {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Err(SourceError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);
        Ok(rx)
    }

    fn stop(&self) {
        // Dropping the sender closes the channel.
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackrelay_core::TrackingType;

    fn source() -> MockDeviceSource {
        MockDeviceSource::new(vec![DeviceDescriptor::new("wand", TrackingType::Position)])
    }

    #[test]
    fn test_mock_source_delivers_injected_updates() {
        // Arrange
        let source = source();
        let mut rx = source.start().expect("start should succeed");

        // Act
        let delivered = source.inject_update(DeviceUpdate::new(0).with_time_stamp(5));

        // Assert
        assert!(delivered);
        let update = rx.try_recv().expect("should receive update");
        assert_eq!(update.time_stamp, Some(5));
    }

    #[test]
    fn test_mock_source_stop_closes_channel() {
        let source = source();
        let mut rx = source.start().unwrap();

        source.stop();

        assert!(rx.try_recv().is_err());
        assert!(!source.is_running());
    }

    #[test]
    fn test_inject_before_start_is_not_delivered() {
        assert!(!source().inject_update(DeviceUpdate::new(0)));
    }

    #[test]
    fn test_second_start_is_rejected() {
        let source = source();
        let _rx = source.start().unwrap();

        assert_eq!(source.start().err(), Some(SourceError::AlreadyStarted));
    }
}
