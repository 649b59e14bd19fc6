//! RelayLink: mirrors an upstream server's devices into the local registry.
//!
//! A relay link is a protocol client of one upstream server and, at the
//! same time, a device provider for this server.  Because relayed devices
//! are ordinary registry slots, a server that relays can itself be relayed
//! from, so chains of any length need no special handling.
//!
//! # State machine (for beginners)
//!
//! ```text
//!                 connect            handshake ok
//!  Disconnected ───────────▶ Connecting ──────────▶ Negotiating
//!       ▲                                              │ devices registered
//!       │      I/O error, protocol error, timeout,     ▼
//!       └──────── upstream DISCONNECT, stop() ───── Relaying
//! ```
//!
//! Every transition back to `Disconnected` marks all slots owned by the link
//! invalid in one registry call, so downstream clients see "link down"
//! rather than a frozen pose.  Unless the link was stopped, it then waits
//! according to its [`ReconnectPolicy`] and tries again.
//!
//! # Slot ownership
//!
//! Upstream devices are registered as [`DeviceOwner::Relay`] with the link's
//! id, under `device_prefix + upstream name`.  If the link reconnects to an
//! upstream with the same descriptor table it keeps its slots, so
//! downstream sessions survive an upstream restart.  A different table
//! replaces the old slots.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use trackrelay_core::{
    Channel, ClientSession, DeviceDescriptor, DeviceOwner, DeviceState, DeviceStateTable, Endpoint,
    LocalRegistry, ProtocolError, RegistryError, SessionError, StateUpdate,
};

use crate::application::stop_requested;

// ── Index mapping ─────────────────────────────────────────────────────────────

/// Maps source device indices (`0..n`) to registry slots.
///
/// Built from the slots the registry handed out, which are distinct, so the
/// mapping is a bijection between the source's devices and those slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMapping {
    local: Vec<usize>,
}

impl IndexMapping {
    pub fn new(local: Vec<usize>) -> Self {
        Self { local }
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// The registry slot of source device `upstream`.
    pub fn local_index(&self, upstream: usize) -> Option<usize> {
        self.local.get(upstream).copied()
    }

    /// The source device stored in registry slot `local`.
    pub fn upstream_index(&self, local: usize) -> Option<usize> {
        self.local.iter().position(|&slot| slot == local)
    }

    /// Every slot, in source index order.
    pub fn local_indices(&self) -> &[usize] {
        &self.local
    }

    /// Rewrites every device index of `update` from source to slot numbering.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::DeviceIndexOutOfRange`] if an entry names a device
    /// the mapping does not know.
    pub fn remap(&self, update: &StateUpdate) -> Result<StateUpdate, ProtocolError> {
        let devices = update
            .devices
            .iter()
            .map(|entry| {
                let index = entry.device as usize;
                self.local_index(index)
                    // Slots are below MAX_DEVICES, so they fit a u16.
                    .map(|slot| entry.reindexed(slot as u16))
                    .ok_or(ProtocolError::DeviceIndexOutOfRange {
                        index,
                        count: self.local.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StateUpdate::new(devices))
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Consecutive failed sessions after which the link gives up; `None` never does.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `retry` (0-based): `initial × multiplier^retry`,
    /// capped at `max_delay`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }
}

/// Runtime settings of one relay link.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Label used in logs.
    pub name: String,
    pub endpoint: Endpoint,
    /// Name sent upstream in `HELLO`.
    pub client_name: String,
    /// Prepended to upstream device names in the local registry.
    pub device_prefix: String,
    /// Highest protocol version offered upstream.
    pub protocol_version: u32,
    /// Longest allowed silence on the upstream link, including connect and handshake.
    pub link_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

// ── Errors and state ──────────────────────────────────────────────────────────

/// Why a relay session ended.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("could not register upstream devices: {0}")]
    Registry(#[from] RegistryError),
}

/// Where a relay link is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Negotiating,
    Relaying,
}

/// The upstream table and the slots it was registered under.
#[derive(Debug)]
struct Registration {
    upstream: Vec<DeviceDescriptor>,
    mapping: IndexMapping,
}

// ── RelayLink ─────────────────────────────────────────────────────────────────

/// One upstream server mirrored into the local registry.
pub struct RelayLink {
    id: Uuid,
    config: RelayConfig,
    registry: Arc<dyn LocalRegistry>,
    state: watch::Sender<RelayState>,
    stop: watch::Sender<bool>,
    registration: Mutex<Option<Registration>>,
    upstream: Mutex<Option<Arc<DeviceStateTable>>>,
}

impl RelayLink {
    pub fn new(config: RelayConfig, registry: Arc<dyn LocalRegistry>) -> Self {
        let (state, _) = watch::channel(RelayState::Disconnected);
        let (stop, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            config,
            registry,
            state,
            stop,
            registration: Mutex::new(None),
            upstream: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The owner tag of every slot this link registers.
    pub fn owner(&self) -> DeviceOwner {
        DeviceOwner::Relay(self.id)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    /// The current upstream → slot mapping; empty before the first handshake.
    pub fn mapping(&self) -> IndexMapping {
        self.lock_registration()
            .as_ref()
            .map(|r| r.mapping.clone())
            .unwrap_or_default()
    }

    /// The link's own copy of the upstream device states, indexed by
    /// upstream index.  Empty before the first handshake.
    pub fn upstream_snapshot(&self) -> Vec<DeviceState> {
        self.upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|table| table.snapshot())
            .unwrap_or_default()
    }

    /// Spawns the reconnect loop.  The task ends after [`Self::stop`] or when
    /// the reconnect policy gives up.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Ends the link.  Safe to call from any task; a read blocked on the
    /// upstream socket is abandoned promptly.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    async fn run(&self) {
        let mut stop = self.stop.subscribe();
        let mut failures: u32 = 0;
        info!(relay = %self.config.name, upstream = %self.config.endpoint, "relay link started");

        loop {
            if *stop.borrow() {
                break;
            }

            let mut relayed = false;
            let result = tokio::select! {
                result = self.run_session(&mut relayed) => Some(result),
                _ = stop_requested(&mut stop) => None,
            };
            self.go_down();

            match result {
                None => break,
                Some(Ok(())) => debug!(relay = %self.config.name, "upstream session ended"),
                Some(Err(e)) => {
                    warn!(relay = %self.config.name, error = %e, "upstream session lost");
                }
            }

            if relayed {
                failures = 0;
            }
            failures += 1;
            if !self.config.reconnect.allows(failures) {
                error!(relay = %self.config.name, failures, "giving up on upstream");
                break;
            }
            let delay = self.config.reconnect.delay(failures - 1);
            debug!(relay = %self.config.name, ?delay, "reconnecting after delay");
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = stop_requested(&mut stop) => break,
            }
        }

        self.set_state(RelayState::Disconnected);
        info!(relay = %self.config.name, "relay link stopped");
    }

    /// One upstream session, from connect to the first error.
    ///
    /// Sets `relayed` once the session reaches [`RelayState::Relaying`].
    async fn run_session(&self, relayed: &mut bool) -> Result<(), RelayError> {
        let limit = self.config.link_timeout;

        self.set_state(RelayState::Connecting);
        let channel = time::timeout(limit, Channel::connect(&self.config.endpoint))
            .await
            .map_err(|_| SessionError::Timeout(limit))?
            .map_err(SessionError::from)?;

        self.set_state(RelayState::Negotiating);
        let mut session = time::timeout(
            limit,
            ClientSession::handshake(
                channel,
                &self.config.client_name,
                self.config.protocol_version,
            ),
        )
        .await
        .map_err(|_| SessionError::Timeout(limit))??;

        let upstream = session.devices().to_vec();
        let table = Arc::new(DeviceStateTable::new(upstream.clone()));
        let mapping = self.register(&upstream)?;
        *self.upstream.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&table));

        self.set_state(RelayState::Relaying);
        *relayed = true;
        info!(
            relay = %self.config.name,
            upstream = %session.info().peer_name,
            version = session.info().version,
            devices = mapping.len(),
            "relaying"
        );

        loop {
            let update = session.next_update_within(limit).await?;
            table.apply_update(&update).map_err(SessionError::from)?;
            let local = mapping.remap(&update).map_err(SessionError::from)?;
            self.registry.apply_update(&local).map_err(SessionError::from)?;
        }
    }

    /// Registers `upstream` locally, reusing the current slots when the
    /// table is unchanged.
    fn register(&self, upstream: &[DeviceDescriptor]) -> Result<IndexMapping, RegistryError> {
        let mut registration = self.lock_registration();
        if let Some(current) = registration.as_ref() {
            if current.upstream == upstream {
                debug!(relay = %self.config.name, "upstream table unchanged; keeping slots");
                return Ok(current.mapping.clone());
            }
            self.registry.unregister_devices(current.mapping.local_indices());
            *registration = None;
        }

        let local: Vec<DeviceDescriptor> = upstream
            .iter()
            .map(|d| d.renamed(format!("{}{}", self.config.device_prefix, d.name)))
            .collect();
        let slots = self.registry.register_devices(self.owner(), &local)?;
        let mapping = IndexMapping::new(slots);
        debug!(
            relay = %self.config.name,
            slots = ?mapping.local_indices(),
            "upstream devices registered"
        );
        *registration = Some(Registration {
            upstream: upstream.to_vec(),
            mapping: mapping.clone(),
        });
        Ok(mapping)
    }

    /// Marks every owned slot invalid and reports `Disconnected`.
    fn go_down(&self) {
        if let Some(current) = self.lock_registration().as_ref() {
            self.registry.invalidate_devices(current.mapping.local_indices());
        }
        if let Some(table) = self.upstream.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            table.invalidate_all();
        }
        self.set_state(RelayState::Disconnected);
    }

    fn set_state(&self, state: RelayState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(relay = %self.config.name, ?previous, ?state, "relay state changed");
        }
    }

    fn lock_registration(&self) -> MutexGuard<'_, Option<Registration>> {
        self.registration.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
