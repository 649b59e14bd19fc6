//! TOML-based configuration for the device server.
//!
//! The server reads its configuration from the path given with `--config`,
//! or else from the platform-appropriate config file:
//! - Windows:  `%APPDATA%\trackrelay\server.toml`
//! - Linux:    `~/.config/trackrelay/server.toml`
//! - macOS:    `~/Library/Application Support/trackrelay/server.toml`
//!
//! # What goes in the file? (for beginners)
//!
//! ```toml
//! [server]
//! name = "lab-server"
//! port = 8555
//!
//! [[devices]]
//! name = "tracker0"
//! tracking = "position_orientation"
//! buttons = 2
//!
//! [[relays]]
//! name = "lab"
//! host = "10.0.0.2"
//! device_prefix = "lab/"
//! ```
//!
//! `[[devices]]` entries describe locally attached devices (driven by the
//! simulated source in this build).  `[[relays]]` entries each start one
//! relay link that mirrors an upstream server's devices into this server.
//!
//! # Serde default values
//!
//! Every field except a relay's `name` and `host` and a device's `name` and
//! `tracking` has a `#[serde(default = ...)]`, so a file only needs to list
//! what differs from the defaults.  A missing default config file is the same
//! as an empty one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use trackrelay_core::protocol::messages::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use trackrelay_core::{DeviceDescriptor, Endpoint, TrackingType, ValuatorKind};

use crate::application::relay::{ReconnectPolicy, RelayConfig};
use crate::infrastructure::network::ServerOptions;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The file parsed but describes an unusable set-up.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub relays: Vec<RelayEntry>,
}

/// Listener and session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    /// Name sent to clients in `SERVER_HELLO` and to upstreams in `HELLO`.
    #[serde(default = "default_server_name")]
    pub name: String,
    /// IP address to bind the TCP listener to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional Unix domain socket to listen on in addition to TCP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<PathBuf>,
    /// Highest protocol version this server advertises.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Settings for the simulated local device source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationSettings {
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
}

/// One locally attached device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    pub name: String,
    pub tracking: TrackingType,
    #[serde(default)]
    pub buttons: u16,
    #[serde(default)]
    pub valuators: Vec<ValuatorKind>,
}

/// One upstream server to relay from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayEntry {
    /// Label used in logs.
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prepended to every upstream device name when it is registered locally.
    #[serde(default)]
    pub device_prefix: String,
    /// A link with no upstream traffic for this long is treated as lost.
    #[serde(default = "default_link_timeout_ms")]
    pub link_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectEntry,
}

/// Backoff settings for one relay link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectEntry {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// `0` retries forever.
    #[serde(default)]
    pub max_attempts: u32,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_server_name() -> String {
    "trackrelay".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8555
}
fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}
fn default_keepalive_interval_ms() -> u64 {
    1000
}
fn default_handshake_timeout_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_update_interval_ms() -> u64 {
    10
}
fn default_link_timeout_ms() -> u64 {
    3000
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            bind_address: default_bind_address(),
            port: default_port(),
            unix_socket: None,
            protocol_version: default_protocol_version(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
        }
    }
}

impl Default for ReconnectEntry {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: 0,
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl ServerSettings {
    /// Every endpoint the server should listen on: TCP, plus the Unix socket if set.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = vec![Endpoint::tcp(&self.bind_address, self.port)];
        #[cfg(unix)]
        if let Some(path) = &self.unix_socket {
            endpoints.push(Endpoint::unix(path));
        }
        endpoints
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn to_options(&self) -> ServerOptions {
        ServerOptions {
            name: self.name.clone(),
            protocol_version: self.protocol_version,
            keepalive_interval: self.keepalive_interval(),
            handshake_timeout: self.handshake_timeout(),
        }
    }
}

impl SimulationSettings {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl DeviceEntry {
    pub fn to_descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(&self.name, self.tracking)
            .with_buttons(self.buttons)
            .with_valuators(self.valuators.clone())
    }
}

impl RelayEntry {
    /// Builds the runtime settings of the relay link this entry describes.
    ///
    /// `server` supplies the name the link introduces itself with upstream and
    /// the highest protocol version it offers.
    pub fn to_relay_config(&self, server: &ServerSettings) -> RelayConfig {
        RelayConfig {
            name: self.name.clone(),
            endpoint: Endpoint::tcp(&self.host, self.port),
            client_name: format!("{}/{}", server.name, self.name),
            device_prefix: self.device_prefix.clone(),
            protocol_version: server.protocol_version,
            link_timeout: Duration::from_millis(self.link_timeout_ms),
            reconnect: self.reconnect.to_policy(),
        }
    }
}

impl ReconnectEntry {
    pub fn to_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
        }
    }
}

impl AppConfig {
    /// Local device descriptors, in configuration order.
    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices.iter().map(DeviceEntry::to_descriptor).collect()
    }

    /// Checks the values serde cannot check on its own.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let version = self.server.protocol_version;
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
            return Err(ConfigError::Invalid(format!(
                "server.protocol_version {version} is outside \
                 {MIN_PROTOCOL_VERSION}..={PROTOCOL_VERSION}"
            )));
        }
        if self.server.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.keepalive_interval_ms must be positive".into(),
            ));
        }
        if self.server.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.handshake_timeout_ms must be positive".into(),
            ));
        }
        if self.simulation.update_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "simulation.update_interval_ms must be positive".into(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
        }

        let mut relays = HashSet::new();
        for relay in &self.relays {
            if !relays.insert(relay.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate relay name '{}'",
                    relay.name
                )));
            }
            if relay.host.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "relay '{}' has an empty host",
                    relay.name
                )));
            }
            if relay.link_timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "relay '{}' link_timeout_ms must be positive",
                    relay.name
                )));
            }
            let multiplier = relay.reconnect.multiplier;
            if multiplier.is_nan() || multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "relay '{}' reconnect.multiplier must be at least 1.0",
                    relay.name
                )));
            }
        }
        Ok(())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("server.toml"))
}

/// Loads and validates the configuration.
///
/// With `path` set, the file must exist.  Without it the default location is
/// used and a missing file yields [`AppConfig::default()`].
///
/// # Errors
///
/// [`ConfigError::Io`], [`ConfigError::Parse`] or [`ConfigError::Invalid`].
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&content)?
        }
        None => {
            let path = config_file_path()?;
            match std::fs::read_to_string(&path) {
                Ok(content) => toml::from_str(&content)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
                Err(e) => return Err(ConfigError::Io { path, source: e }),
            }
        }
    };
    config.validate()?;
    Ok(config)
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory with the `trackrelay` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("trackrelay"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("trackrelay"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h).join("Library").join("Application Support").join("trackrelay")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
