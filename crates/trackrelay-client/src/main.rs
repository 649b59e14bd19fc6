//! trackrelay-monitor: prints the live state of a device server's devices.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ DeviceClient::start()   -- reconnect loop, mirrors state into a table
//!  └─ event loop
//!       ├─ Connected     -> print the device table
//!       ├─ Updated       -> print one line per changed device
//!       └─ Disconnected  -> print every device (now invalid)
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trackrelay_client::application::monitor::{format_devices, DeviceFilter};
use trackrelay_client::infrastructure::network::{ClientConfig, ClientEvent, DeviceClient};
use trackrelay_core::protocol::messages::PROTOCOL_VERSION;
use trackrelay_core::Endpoint;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Watches the devices of a trackrelay server.
#[derive(Debug, Parser)]
#[command(
    name = "trackrelay-monitor",
    about = "Prints live tracking device state from a trackrelay server",
    version
)]
struct Cli {
    /// Server host name or address.
    #[arg(long, default_value = "127.0.0.1", env = "TRACKRELAY_HOST")]
    host: String,

    /// Server TCP port.
    #[arg(long, short, default_value_t = 8555, env = "TRACKRELAY_PORT")]
    port: u16,

    /// Connect to this Unix-domain socket instead of TCP.
    #[arg(long, conflicts_with = "host")]
    unix: Option<PathBuf>,

    /// Name sent to the server.
    #[arg(long, default_value = "trackrelay-monitor")]
    name: String,

    /// Highest protocol version to offer.
    #[arg(long, default_value_t = PROTOCOL_VERSION)]
    protocol_version: u32,

    /// Only print devices whose name contains this text.
    #[arg(long)]
    filter: Option<String>,

    /// Print every device on each update, not just the changed ones.
    #[arg(long)]
    all: bool,

    /// Milliseconds between reconnect attempts.
    #[arg(long, default_value_t = 1000)]
    reconnect_ms: u64,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "TRACKRELAY_LOG_LEVEL")]
    log_level: String,
}

impl Cli {
    fn endpoint(&self) -> Endpoint {
        #[cfg(unix)]
        if let Some(path) = &self.unix {
            return Endpoint::unix(path);
        }
        Endpoint::tcp(&self.host, self.port)
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint(),
            client_name: self.name.clone(),
            protocol_version: self.protocol_version,
            reconnect_interval: Duration::from_millis(self.reconnect_ms),
            ..ClientConfig::default()
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.client_config();
    let filter = DeviceFilter {
        name_contains: cli.filter.clone(),
    };
    info!(endpoint = %config.endpoint, "trackrelay monitor starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (mut events, client) = DeviceClient::new(config).start(shutdown_rx);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_tx.send_replace(true);
        }
    });

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(event) = events.recv().await {
        let lines = match event {
            ClientEvent::Connected { server, version, table } => {
                println!("connected to {server} (protocol v{version}, {} devices)", table.len());
                format_devices(&table, None, &filter)
            }
            ClientEvent::Updated { table, devices } => {
                let changed = (!cli.all).then_some(devices.as_slice());
                format_devices(&table, changed, &filter)
            }
            ClientEvent::Disconnected { table, reason } => {
                warn!(%reason, "disconnected; devices marked invalid");
                format_devices(&table, None, &filter)
            }
        };
        for line in lines {
            println!("{line}");
        }
    }

    client.await?;
    info!("trackrelay monitor stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
