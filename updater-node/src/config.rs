//! Configuration management for the updater daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/updater/updaterd.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP API configuration
    pub server: ServerConfig,
    /// Update handling configuration
    pub updates: UpdatesConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Defaults plus CLI overrides, used when no config file exists.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(ref download_dir) = args.download_dir {
            self.updates.download_dir = PathBuf::from(download_dir);
        }

        if let Some(ref server_url) = args.server_url {
            self.updates.server_url = server_url.clone();
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.server
            .listen_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| format!("Invalid listen address '{}': {}", self.server.listen_address, e))?;
        self.updates.validate()
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8085".to_string(),
        }
    }
}

/// Update handling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdatesConfig {
    /// Directory holding downloaded and imported packages
    pub download_dir: PathBuf,
    /// URL of the update list JSON
    pub server_url: String,
    /// Registry state file; `None` keeps state in memory only
    pub state_file: Option<PathBuf>,
    /// Hex-encoded ed25519 public keys trusted for package signatures
    pub trusted_keys: Vec<String>,
    /// Display name of locally imported updates
    pub local_update_name: String,
    /// Installer command; the package path is appended as last argument
    pub install_command: Vec<String>,
    /// HTTP connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Timeout in seconds for fetching the update list
    pub check_timeout_secs: u64,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("/var/lib/updater/updates"),
            server_url: "https://updates.example.org/api/v1/updates.json".to_string(),
            state_file: Some(PathBuf::from("/var/lib/updater/updates.json")),
            trusted_keys: Vec::new(),
            local_update_name: "Local update".to_string(),
            install_command: vec!["/usr/libexec/updater/install-package".to_string()],
            connect_timeout_secs: 30,
            check_timeout_secs: 60,
        }
    }
}

impl UpdatesConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server_url.is_empty() {
            return Err("Update server URL cannot be empty".to_string());
        }

        if self.download_dir.as_os_str().is_empty() {
            return Err("Download directory cannot be empty".to_string());
        }

        if self.install_command.is_empty() {
            return Err("Install command cannot be empty".to_string());
        }

        for key in &self.trusted_keys {
            updater_core::verifier::parse_public_key(key)
                .map_err(|e| format!("Invalid trusted key '{}': {}", key, e))?;
        }

        if self.connect_timeout_secs == 0 || self.check_timeout_secs == 0 {
            return Err("Timeouts must be greater than zero".to_string());
        }

        Ok(())
    }
}
