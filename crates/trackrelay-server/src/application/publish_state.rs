//! StatePublisher: turns registry snapshots into outbound state updates.
//!
//! One publisher exists per client session.  It remembers the descriptor
//! table the session exported (as the registry generation it was built at)
//! and the registry revision it last sent for every device, so that:
//!
//! - the first update after the handshake carries every device,
//! - later updates carry only devices whose revision moved on (deltas),
//! - an invalid device goes out as a time stamp plus `valid = false`, never
//!   with its last pose,
//! - a snapshot from another generation is refused with [`LayoutChanged`];
//!   the session must then end so the client can fetch the new table.
//!
//! # Exported indices
//!
//! The exported table lists occupied registry slots in slot order, so the
//! exported index of a device is its position in [`RegistrySnapshot::devices`],
//! not its slot index.  Within one generation that position never changes.

use thiserror::Error;
use trackrelay_core::{
    Capabilities, DeviceUpdate, RegisteredDevice, RegistrySnapshot, StateUpdate, TrackingType,
    Velocity,
};

/// The registry's device set changed since the session was set up.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("device set changed (session generation {session}, registry generation {current})")]
pub struct LayoutChanged {
    pub session: u64,
    pub current: u64,
}

/// Per-session delta encoder.
#[derive(Debug)]
pub struct StatePublisher {
    generation: u64,
    caps: Capabilities,
    /// Revision last sent, per exported index.
    sent: Vec<Option<u64>>,
}

impl StatePublisher {
    /// Creates a publisher for a session whose descriptor table was built
    /// from `snapshot`.
    pub fn new(snapshot: &RegistrySnapshot, caps: Capabilities) -> Self {
        Self {
            generation: snapshot.generation,
            caps,
            sent: vec![None; snapshot.devices.len()],
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The update that brings the session up to date with `snapshot`, or
    /// `None` if nothing changed since the last call.
    ///
    /// # Errors
    ///
    /// [`LayoutChanged`] if `snapshot` is from a different generation.
    pub fn next_update(
        &mut self,
        snapshot: &RegistrySnapshot,
    ) -> Result<Option<StateUpdate>, LayoutChanged> {
        if snapshot.generation != self.generation || snapshot.devices.len() != self.sent.len() {
            return Err(LayoutChanged {
                session: self.generation,
                current: snapshot.generation,
            });
        }

        let mut devices = Vec::new();
        for (index, device) in snapshot.devices.iter().enumerate() {
            if self.sent[index] == Some(device.revision) {
                continue;
            }
            self.sent[index] = Some(device.revision);
            if let Some(update) = self.encode(index as u16, device) {
                devices.push(update);
            }
        }
        Ok((!devices.is_empty()).then(|| StateUpdate::new(devices)))
    }

    fn encode(&self, index: u16, device: &RegisteredDevice) -> Option<DeviceUpdate> {
        let state = &device.state;
        if !state.valid {
            // Without the validity flag an entry would read as valid.
            return self
                .caps
                .has_validity()
                .then(|| DeviceUpdate::invalid(index, state.time_stamp));
        }

        let mut update = DeviceUpdate::new(index)
            .with_time_stamp(state.time_stamp)
            .with_valid(true);
        if device.descriptor.tracking != TrackingType::None {
            update = update.with_pose(state.pose).with_velocity(Velocity {
                linear: state.linear_velocity,
                angular: state.angular_velocity,
            });
        }
        if !state.buttons.is_empty() {
            update = update.with_buttons(state.buttons.clone());
        }
        if !state.valuators.is_empty() {
            update = update.with_valuators(state.valuators.clone());
        }
        Some(update)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
