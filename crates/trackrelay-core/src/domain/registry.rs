//! The server-side local device registry.
//!
//! The registry is the one shared artifact of a device server.  It is written
//! by the local device sources and by any number of relay links, and read by
//! every client session that encodes outbound state updates.
//!
//! # Slots, owners and revisions
//!
//! Devices live in *slots*.  A slot index is what the registry's own clients
//! see as a device index, so slots are never moved; unregistering a device
//! leaves a vacancy that the next registration reuses.  Each slot records its
//! [`DeviceOwner`] so a relay link can find and invalidate exactly the devices
//! it brought in.
//!
//! Two counters let sessions work incrementally:
//!
//! - **revision**: bumped for every slot an update or invalidation touches.
//!   A session remembers the revision it last sent per slot and only encodes
//!   slots that moved on (delta updates).
//! - **generation**: bumped on every register/unregister.  A session whose
//!   descriptor table was built at an older generation must end; clients
//!   reconnect and receive the new table.
//!
//! Both are published through `tokio::sync::watch` channels so writers never
//! wait for readers.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::domain::device::{local_time_micros, DeviceDescriptor, DeviceState};
use crate::domain::snapshot::ApplyOutcome;
use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::StateUpdate;

/// Maximum number of slots; device indices travel as `u16`.
pub const MAX_DEVICES: usize = u16::MAX as usize;

/// Who feeds a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOwner {
    /// A device source attached to this server.
    Local,
    /// A relay link, identified by its id.
    Relay(Uuid),
}

/// Errors raised by registry mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry full: cannot add {requested} devices ({available} slots free)")]
    Full { requested: usize, available: usize },
}

/// One occupied slot, as seen in a [`RegistrySnapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredDevice {
    pub index: usize,
    pub descriptor: Arc<DeviceDescriptor>,
    pub owner: DeviceOwner,
    pub state: DeviceState,
    pub revision: u64,
}

/// A consistent view of every occupied slot, in slot order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub generation: u64,
    pub devices: Vec<RegisteredDevice>,
}

impl RegistrySnapshot {
    /// The descriptor table a session built from this snapshot exports.
    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices.iter().map(|d| (*d.descriptor).clone()).collect()
    }
}

/// The operations the relay and the local sources need from a registry.
///
/// [`DeviceRegistry`] is the production implementation; tests substitute a
/// mock.
pub trait LocalRegistry: Send + Sync {
    /// Registers `descriptors` under `owner`; returns their slot indices, in order.
    ///
    /// Never returns a slot that is already occupied.
    fn register_devices(
        &self,
        owner: DeviceOwner,
        descriptors: &[DeviceDescriptor],
    ) -> Result<Vec<usize>, RegistryError>;

    /// Frees the given slots.  Vacant or unknown indices are ignored.
    fn unregister_devices(&self, indices: &[usize]);

    /// Applies an update whose device indices are slot indices.
    ///
    /// All-or-nothing: a bad entry leaves every slot unchanged.
    fn apply_update(&self, update: &StateUpdate) -> Result<ApplyOutcome, ProtocolError>;

    /// Marks the given slots invalid in one step.
    fn invalidate_devices(&self, indices: &[usize]);

    fn snapshot(&self) -> RegistrySnapshot;
}

// ── DeviceRegistry ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot {
    descriptor: Arc<DeviceDescriptor>,
    owner: DeviceOwner,
    state: DeviceState,
    revision: u64,
}

#[derive(Debug, Default)]
struct Inner {
    slots: Vec<Option<Slot>>,
    generation: u64,
    revision: u64,
}

impl Inner {
    fn occupied(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn vacancies(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count() + (MAX_DEVICES - self.slots.len())
    }
}

/// The server's device registry.
#[derive(Debug)]
pub struct DeviceRegistry {
    inner: RwLock<Inner>,
    changes: watch::Sender<u64>,
    layout: watch::Sender<u64>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        let (layout, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner::default()),
            changes,
            layout,
        }
    }

    /// Notified with the latest revision after every state change.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Notified with the latest generation after every register/unregister.
    pub fn subscribe_layout(&self) -> watch::Receiver<u64> {
        self.layout.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.read_inner().generation
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.read_inner().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot indices currently owned by `owner`, ascending.
    pub fn owned_by(&self, owner: DeviceOwner) -> Vec<usize> {
        self.read_inner()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().filter(|s| s.owner == owner).map(|_| i))
            .collect()
    }

    /// Applies `update` using `local_now` for entries without a time stamp.
    pub fn apply_update_at(
        &self,
        update: &StateUpdate,
        local_now: u64,
    ) -> Result<ApplyOutcome, ProtocolError> {
        let (revision, outcome) = {
            let mut inner = self.write_inner();
            for entry in &update.devices {
                let index = entry.device as usize;
                let slot = inner.occupied(index).ok_or(ProtocolError::DeviceIndexOutOfRange {
                    index,
                    count: inner.slots.len(),
                })?;
                DeviceState::check(&slot.descriptor, index, entry)?;
            }

            let mut outcome = ApplyOutcome::default();
            let mut revision = inner.revision;
            for entry in &update.devices {
                let index = entry.device as usize;
                if let Some(slot) = inner.slots[index].as_mut() {
                    revision += 1;
                    if slot.state.apply(&slot.descriptor, entry, local_now) {
                        outcome.late.push(index);
                    }
                    slot.revision = revision;
                    outcome.applied += 1;
                }
            }
            inner.revision = revision;
            (revision, outcome)
        };
        if outcome.applied > 0 {
            self.changes.send_replace(revision);
        }
        Ok(outcome)
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LocalRegistry for DeviceRegistry {
    fn register_devices(
        &self,
        owner: DeviceOwner,
        descriptors: &[DeviceDescriptor],
    ) -> Result<Vec<usize>, RegistryError> {
        let (generation, indices) = {
            let mut inner = self.write_inner();
            let available = inner.vacancies();
            if descriptors.len() > available {
                return Err(RegistryError::Full {
                    requested: descriptors.len(),
                    available,
                });
            }

            let mut indices = Vec::with_capacity(descriptors.len());
            let mut search_from = 0;
            for descriptor in descriptors {
                let slot = Slot {
                    descriptor: Arc::new(descriptor.clone()),
                    owner,
                    state: DeviceState::new(descriptor),
                    revision: 0,
                };
                let vacant = inner.slots[search_from..]
                    .iter()
                    .position(Option::is_none)
                    .map(|offset| search_from + offset);
                let index = match vacant {
                    Some(index) => {
                        inner.slots[index] = Some(slot);
                        index
                    }
                    None => {
                        inner.slots.push(Some(slot));
                        inner.slots.len() - 1
                    }
                };
                search_from = index + 1;
                indices.push(index);
            }
            if !indices.is_empty() {
                inner.generation += 1;
            }
            debug!(?owner, ?indices, generation = inner.generation, "devices registered");
            (inner.generation, indices)
        };
        if !indices.is_empty() {
            self.layout.send_replace(generation);
        }
        Ok(indices)
    }

    fn unregister_devices(&self, indices: &[usize]) {
        let generation = {
            let mut inner = self.write_inner();
            let mut removed = 0;
            for &index in indices {
                if let Some(slot) = inner.slots.get_mut(index) {
                    if slot.take().is_some() {
                        removed += 1;
                    }
                }
            }
            while matches!(inner.slots.last(), Some(None)) {
                inner.slots.pop();
            }
            if removed == 0 {
                return;
            }
            inner.generation += 1;
            debug!(?indices, generation = inner.generation, "devices unregistered");
            inner.generation
        };
        self.layout.send_replace(generation);
    }

    fn apply_update(&self, update: &StateUpdate) -> Result<ApplyOutcome, ProtocolError> {
        self.apply_update_at(update, local_time_micros())
    }

    fn invalidate_devices(&self, indices: &[usize]) {
        let revision = {
            let mut inner = self.write_inner();
            let mut revision = inner.revision;
            for &index in indices {
                if let Some(Some(slot)) = inner.slots.get_mut(index) {
                    revision += 1;
                    slot.state.invalidate();
                    slot.revision = revision;
                }
            }
            if revision == inner.revision {
                return;
            }
            inner.revision = revision;
            revision
        };
        self.changes.send_replace(revision);
    }

    fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.read_inner();
        RegistrySnapshot {
            generation: inner.generation,
            devices: inner
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    slot.as_ref().map(|slot| RegisteredDevice {
                        index,
                        descriptor: Arc::clone(&slot.descriptor),
                        owner: slot.owner,
                        state: slot.state.clone(),
                        revision: slot.revision,
                    })
                })
                .collect(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
