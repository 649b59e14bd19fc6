//! LocalDevicePump: feeds a local device source into the registry.
//!
//! The pump registers the source's devices as [`DeviceOwner::Local`], then
//! forwards every reading under its registry slot index.  Readings that are
//! already queued when the pump wakes up are applied together, so one
//! registry write (and one outbound update per client) covers them all.
//! Each reading is checked against its descriptor first; a reading that
//! does not fit is dropped on its own and never takes the batch with it.
//!
//! When the pump stops, either because shutdown was signalled or because
//! the source closed its channel, the source is stopped and its devices are
//! marked invalid.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trackrelay_core::{
    DeviceDescriptor, DeviceOwner, DeviceState, DeviceUpdate, LocalRegistry, RegistryError,
    StateUpdate,
};

use crate::application::relay::IndexMapping;
use crate::application::stop_requested;
use crate::infrastructure::device_source::{DeviceSource, SourceError};

/// Error type for starting a pump.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("could not register local devices: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Connects one [`DeviceSource`] to a [`LocalRegistry`].
pub struct LocalDevicePump {
    source: Arc<dyn DeviceSource>,
    registry: Arc<dyn LocalRegistry>,
}

impl LocalDevicePump {
    pub fn new(source: Arc<dyn DeviceSource>, registry: Arc<dyn LocalRegistry>) -> Self {
        Self { source, registry }
    }

    /// Registers the source's devices, starts the source and spawns the
    /// forwarding task.
    ///
    /// Returns the slot mapping together with the task handle.
    ///
    /// # Errors
    ///
    /// [`PumpError::Registry`] if the registry has no room;
    /// [`PumpError::Source`] if the source refuses to start (its devices are
    /// unregistered again).
    pub fn start(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(IndexMapping, JoinHandle<()>), PumpError> {
        let descriptors = self.source.descriptors();
        let slots = self.registry.register_devices(DeviceOwner::Local, &descriptors)?;
        let mapping = IndexMapping::new(slots);

        let mut readings = match self.source.start() {
            Ok(rx) => rx,
            Err(e) => {
                self.registry.unregister_devices(mapping.local_indices());
                return Err(e.into());
            }
        };
        info!(
            devices = mapping.len(),
            slots = ?mapping.local_indices(),
            "local devices registered"
        );

        let task_mapping = mapping.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    reading = readings.recv() => {
                        let Some(first) = reading else {
                            debug!("device source closed");
                            break;
                        };
                        let mut batch = vec![first];
                        while let Ok(next) = readings.try_recv() {
                            batch.push(next);
                        }
                        self.forward(&task_mapping, &descriptors, batch);
                    }
                    _ = stop_requested(&mut shutdown) => break,
                }
            }
            self.source.stop();
            self.registry.invalidate_devices(task_mapping.local_indices());
            info!("local device pump stopped");
        });
        Ok((mapping, handle))
    }

    fn forward(
        &self,
        mapping: &IndexMapping,
        descriptors: &[DeviceDescriptor],
        readings: Vec<DeviceUpdate>,
    ) {
        let mut devices = Vec::with_capacity(readings.len());
        for reading in &readings {
            let index = reading.device as usize;
            let (Some(slot), Some(descriptor)) =
                (mapping.local_index(index), descriptors.get(index))
            else {
                warn!(device = reading.device, "dropping reading for unknown source device");
                continue;
            };
            if let Err(e) = DeviceState::check(descriptor, index, reading) {
                warn!(device = %descriptor.name, error = %e, "dropping malformed reading");
                continue;
            }
            devices.push(reading.reindexed(slot as u16));
        }
        if devices.is_empty() {
            return;
        }
        if let Err(e) = self.registry.apply_update(&StateUpdate::new(devices)) {
            warn!(error = %e, "registry rejected local readings");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
