//! trackrelay device server entry point.
//!
//! Wires the registry, the local device source, relay links and listeners
//! together, then runs until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()               -- TOML file, CLI overrides
//!  └─ DeviceRegistry::new()       -- shared by everything below
//!  └─ start services
//!       ├─ LocalDevicePump   (SimulatedSource → registry)
//!       ├─ RelayLink × n     (upstream server → registry)
//!       └─ DeviceServer × n  (registry → clients; TCP, optional Unix socket)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trackrelay_core::{DeviceRegistry, LocalRegistry};
use trackrelay_server::application::pump_local::LocalDevicePump;
use trackrelay_server::application::relay::RelayLink;
use trackrelay_server::infrastructure::device_source::simulated::SimulatedSource;
use trackrelay_server::infrastructure::network::DeviceServer;
use trackrelay_server::infrastructure::storage::config::{
    config_file_path, load_config, save_config, AppConfig,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// trackrelay device server.
///
/// Serves local (simulated) tracking devices and devices relayed from other
/// servers to any number of clients.
#[derive(Debug, Parser)]
#[command(
    name = "trackrelay-server",
    about = "Tracking device server with daisy-chainable relays",
    version
)]
struct Cli {
    /// Configuration file.  Defaults to the platform config directory.
    #[arg(long, short, env = "TRACKRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// TCP port to listen on, overriding `server.port`.
    #[arg(long, short, env = "TRACKRELAY_PORT")]
    port: Option<u16>,

    /// Log level used when `RUST_LOG` is unset, overriding `server.log_level`.
    #[arg(long, env = "TRACKRELAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Write a default configuration (with the overrides above) to the
    /// config path and exit.
    #[arg(long)]
    write_default_config: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = &self.log_level {
            config.server.log_level = level.clone();
        }
    }

    /// Writes the default configuration and returns where it went.
    fn write_default_config(&self) -> anyhow::Result<PathBuf> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => config_file_path()?,
        };
        let mut config = AppConfig::default();
        self.apply_overrides(&mut config);
        save_config(&config, &path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// The registry as the interface device sources and relay links write through.
fn local_registry(registry: &Arc<DeviceRegistry>) -> Arc<dyn LocalRegistry> {
    Arc::clone(registry) as Arc<dyn LocalRegistry>
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.write_default_config {
        let path = cli.write_default_config()?;
        println!("wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply_overrides(&mut config);

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!(name = %config.server.name, "trackrelay server starting");

    let registry = Arc::new(DeviceRegistry::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // ── Local devices ─────────────────────────────────────────────────────────
    let descriptors = config.descriptors();
    if !descriptors.is_empty() {
        let source = Arc::new(SimulatedSource::new(
            descriptors,
            config.simulation.update_interval(),
        ));
        let (_, pump) = LocalDevicePump::new(source, local_registry(&registry))
            .start(shutdown_rx.clone())
            .context("failed to start local devices")?;
        tasks.push(pump);
    }

    // ── Relay links ───────────────────────────────────────────────────────────
    let links: Vec<Arc<RelayLink>> = config
        .relays
        .iter()
        .map(|entry| {
            Arc::new(RelayLink::new(
                entry.to_relay_config(&config.server),
                local_registry(&registry),
            ))
        })
        .collect();
    for link in &links {
        tasks.push(Arc::clone(link).start());
    }

    // ── Listeners ─────────────────────────────────────────────────────────────
    let options = config.server.to_options();
    for endpoint in config.server.endpoints() {
        let server = DeviceServer::bind(&endpoint, Arc::clone(&registry), options.clone()).await?;
        tasks.push(tokio::spawn(server.run(shutdown_rx.clone())));
    }

    info!(
        devices = registry.len(),
        relays = links.len(),
        "trackrelay server ready.  Press Ctrl-C to exit."
    );

    // ── Ctrl-C ────────────────────────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown signal received");

    for link in &links {
        link.stop();
    }
    shutdown_tx.send_replace(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "service task failed");
        }
    }

    info!("trackrelay server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use trackrelay_core::{DeviceDescriptor, DeviceOwner, TrackingType};

    #[test]
    fn test_cli_without_arguments_keeps_config_values() {
        // Arrange
        let cli = Cli::parse_from(["trackrelay-server"]);
        let mut config = AppConfig::default();

        // Act
        cli.apply_overrides(&mut config);

        // Assert
        assert_eq!(config, AppConfig::default());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_overrides_port_and_log_level() {
        // Arrange
        let cli = Cli::parse_from(["trackrelay-server", "--port", "9000", "--log-level", "debug"]);
        let mut config = AppConfig::default();

        // Act
        cli.apply_overrides(&mut config);

        // Assert
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.log_level, "debug");
    }

    #[test]
    fn test_local_registry_shares_the_server_registry() {
        // Arrange
        let registry = Arc::new(DeviceRegistry::new());

        // Act
        let local = local_registry(&registry);
        local
            .register_devices(
                DeviceOwner::Local,
                &[DeviceDescriptor::new("tracker0", TrackingType::Position)],
            )
            .unwrap();

        // Assert
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_write_default_config_produces_a_loadable_file() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("trackrelay-cli-{}", uuid::Uuid::new_v4()));
        let path = dir.join("server.toml");
        let cli = Cli::parse_from([
            "trackrelay-server",
            "--write-default-config",
            "--port",
            "9100",
            "-c",
            path.to_str().unwrap(),
        ]);

        // Act
        let written = cli.write_default_config().unwrap();
        let loaded = load_config(Some(&written)).unwrap();

        // Assert
        assert_eq!(written, path);
        assert_eq!(loaded.server.port, 9100);
        assert_eq!(loaded.relays, AppConfig::default().relays);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_cli_accepts_config_path() {
        let cli = Cli::parse_from(["trackrelay-server", "-c", "/etc/trackrelay/server.toml"]);

        assert_eq!(cli.config, Some(PathBuf::from("/etc/trackrelay/server.toml")));
    }
}
