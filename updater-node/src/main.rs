//! # Updater Daemon
//!
//! `updaterd` tracks firmware updates on the device: it checks the update
//! server, downloads and verifies packages, imports locally supplied ones
//! and hands verified packages to the installer. Clients drive it through
//! an HTTP API and follow progress over a WebSocket.
//!
//! ## Usage
//! ```bash
//! updaterd --config /etc/updater/updaterd.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use updater_common::LogFormat;

mod callback;
mod checker;
mod cli;
mod config;
mod downloader;
mod error;
mod http_server;
mod installer;
mod server;
mod service;

use cli::Args;
use config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let log_format = if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    log_format.init(&args.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting updater daemon"
    );

    // Load configuration
    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(
                    config_path = %DEFAULT_CONFIG_PATH,
                    "Configuration loaded from default location"
                );
                cfg.with_cli_overrides(&args)
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Config::default_with_cli(&args)
            }
        },
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!(e));
    }

    info!(
        listen = %config.server.listen_address,
        download_dir = %config.updates.download_dir.display(),
        "Updater daemon configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
