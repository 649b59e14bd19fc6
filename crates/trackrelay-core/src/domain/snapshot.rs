//! The client-side device state table.
//!
//! One [`DeviceStateTable`] exists per session.  Protocol decode writes to it;
//! any number of consumers (rendering, interaction, logging) read from it
//! concurrently through [`DeviceStateTable::snapshot`].
//!
//! Every update is validated in full before the write lock is taken, and
//! then applied under a single write lock, so readers never see a message
//! half-applied and a bad message changes nothing.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::device::{local_time_micros, DeviceDescriptor, DeviceState};
use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::StateUpdate;

/// What an [`DeviceStateTable::apply_update`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Number of device entries applied.
    pub applied: usize,
    /// Indices whose update carried a time stamp older than the stored one.
    pub late: Vec<usize>,
}

/// Per-device state mirrored from a server, indexed by the session's
/// descriptor table.
#[derive(Debug)]
pub struct DeviceStateTable {
    descriptors: Vec<DeviceDescriptor>,
    states: RwLock<Vec<DeviceState>>,
}

impl DeviceStateTable {
    /// Allocates one invalid [`DeviceState`] per descriptor.
    pub fn new(descriptors: Vec<DeviceDescriptor>) -> Self {
        let states = descriptors.iter().map(DeviceState::new).collect();
        Self {
            descriptors,
            states: RwLock::new(states),
        }
    }

    pub fn descriptors(&self) -> &[DeviceDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Applies `update`, stamping entries without a time stamp with the local clock.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::DeviceIndexOutOfRange`], [`ProtocolError::CountMismatch`]
    /// or [`ProtocolError::PoseNotTracked`]; the table is unchanged on error.
    pub fn apply_update(&self, update: &StateUpdate) -> Result<ApplyOutcome, ProtocolError> {
        self.apply_update_at(update, local_time_micros())
    }

    /// [`Self::apply_update`] with an explicit local clock reading.
    pub fn apply_update_at(
        &self,
        update: &StateUpdate,
        local_now: u64,
    ) -> Result<ApplyOutcome, ProtocolError> {
        for entry in &update.devices {
            let index = entry.device as usize;
            let descriptor =
                self.descriptors.get(index).ok_or(ProtocolError::DeviceIndexOutOfRange {
                    index,
                    count: self.descriptors.len(),
                })?;
            DeviceState::check(descriptor, index, entry)?;
        }

        let mut outcome = ApplyOutcome::default();
        let mut states = self.write_states();
        for entry in &update.devices {
            let index = entry.device as usize;
            if states[index].apply(&self.descriptors[index], entry, local_now) {
                outcome.late.push(index);
            }
            outcome.applied += 1;
        }
        Ok(outcome)
    }

    /// A point-in-time copy of every device's state.
    pub fn snapshot(&self) -> Vec<DeviceState> {
        self.read_states().clone()
    }

    /// A copy of one device's state.
    pub fn device(&self, index: usize) -> Option<DeviceState> {
        self.read_states().get(index).cloned()
    }

    /// Marks every device invalid in one step.
    pub fn invalidate_all(&self) {
        let mut states = self.write_states();
        for state in states.iter_mut() {
            state.invalidate();
        }
    }

    fn read_states(&self) -> RwLockReadGuard<'_, Vec<DeviceState>> {
        self.states.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_states(&self) -> RwLockWriteGuard<'_, Vec<DeviceState>> {
        self.states.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
