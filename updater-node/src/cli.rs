//! Command-line argument parsing.

use clap::Parser;

/// Updater daemon - firmware update lifecycle service
#[derive(Parser, Debug)]
#[command(name = "updaterd")]
#[command(about = "Updater daemon - firmware update lifecycle service")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "UPDATERD_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Listen address for the HTTP API
    #[arg(long)]
    pub listen: Option<String>,

    /// Directory holding downloaded and imported packages
    #[arg(long)]
    pub download_dir: Option<String>,

    /// URL of the update list
    #[arg(long)]
    pub server_url: Option<String>,
}
