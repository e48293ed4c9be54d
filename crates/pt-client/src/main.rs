//! portr tunnel client
//!
//! Exposes one configured local service through the tunnel server until
//! interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pt_client::TunnelClient;
use pt_core::config::{self, Config};

#[derive(Parser)]
#[command(name = "portr")]
#[command(about = "Expose a local service through a portr tunnel server")]
#[command(version)]
struct Args {
    /// Tunnel to start, by name or subdomain (defaults to the first one)
    tunnel: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the private key (overrides config)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut file_config: Config = config::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    if let Some(key) = args.key {
        file_config.key_path = Some(key);
    }

    // Initialize logging
    let log_level = if args.foreground || file_config.debug {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let client_config = file_config
        .client_config(args.tunnel.as_deref())
        .context("Invalid tunnel configuration")?;

    tracing::info!(
        "Starting {} tunnel '{}' for {}",
        client_config.tunnel.tunnel_type,
        client_config.tunnel.label(),
        client_config.local_addr()
    );
    tracing::debug!("Tunnel server: {}", client_config.server_addr());

    if let Err(e) = TunnelClient::new(client_config).start().await {
        if e.is_setup() {
            tracing::error!("Tunnel could not be established: {}", e);
        }
        return Err(e).context("Tunnel client failed");
    }

    Ok(())
}
