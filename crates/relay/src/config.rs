//! Configuration management for the Relay server.
//!
//! This module handles loading, environment overrides, validation and
//! conversion of the TOML application configuration into a
//! [`ServerConfig`].

use anyhow::{Context, Result};
use relay_server::{Protocol, ServerConfig, TlsConfig, DEFAULT_LISTEN_BACKLOG};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::cli::ListenOverrides;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_path() -> String {
    "/".to_string()
}

fn default_protocol() -> String {
    "auto".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    10
}

fn default_listen_backlog() -> i32 {
    DEFAULT_LISTEN_BACKLOG
}

fn default_private_key() -> String {
    "private_key.key".to_string()
}

fn default_certificate() -> String {
    "certificate.pem".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

/// Application configuration loaded from a TOML file.
///
/// Every field has a serde default, so a file holding only the values an
/// operator cares about loads cleanly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ServerSettings,
    /// PEM material for `wss` and `auto`
    #[serde(default)]
    pub tls: TlsSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Listener configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Advertised path; part of the address that keys the backlog
    #[serde(default = "default_path")]
    pub path: String,
    /// `ws`, `wss` or `auto`
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Upper bound of each reactor poll wait, in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Length of the OS accept queue
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Backlog mailbox root; the system temp directory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog_dir: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            protocol: default_protocol(),
            poll_timeout_ms: default_poll_timeout_ms(),
            listen_backlog: default_listen_backlog(),
            backlog_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default = "default_private_key")]
    pub private_key: String,
    #[serde(default = "default_certificate")]
    pub certificate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            private_key: default_private_key(),
            certificate: default_certificate(),
            passphrase: None,
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes a default configuration file at the
    /// specified path and returns the defaults.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse configuration file {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)
                .context("Failed to serialize default configuration")?;
            std::fs::write(path, toml_content)
                .with_context(|| format!("Failed to write default configuration to {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Reads `path` when it exists, otherwise returns the defaults without
    /// touching the filesystem.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(AppConfig::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))
    }

    /// Applies `WS_HOST`, `WS_PORT`, `WS_PATH` and `WS_PROTOCOL` from the
    /// process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies environment-style overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("WS_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("WS_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("WS_PORT is not a valid port: {port}"))?;
        }
        if let Some(path) = lookup("WS_PATH") {
            self.server.path = path;
        }
        if let Some(protocol) = lookup("WS_PROTOCOL") {
            self.server.protocol = protocol;
        }
        Ok(())
    }

    /// Applies listen overrides given on the command line.
    pub fn apply_overrides(&mut self, overrides: &ListenOverrides) {
        if let Some(host) = &overrides.host {
            self.server.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(path) = &overrides.path {
            self.server.path = path.clone();
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if !self.server.path.starts_with('/') {
            return Err(format!("Server path must start with '/': {}", self.server.path));
        }

        let protocol = self
            .server
            .protocol
            .parse::<Protocol>()
            .map_err(|e| e.to_string())?;

        if self.server.poll_timeout_ms == 0 {
            return Err("Poll timeout must be greater than 0".to_string());
        }

        if protocol == Protocol::Wss
            && (self.tls.private_key.trim().is_empty() || self.tls.certificate.trim().is_empty())
        {
            return Err("Protocol wss requires both tls.private_key and tls.certificate".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    /// Converts the application configuration into a [`ServerConfig`].
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let defaults = ServerConfig::default();
        let protocol = self
            .server
            .protocol
            .parse::<Protocol>()
            .context("Invalid server protocol")?;

        Ok(ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            path: self.server.path.clone(),
            protocol,
            tls: TlsConfig {
                private_key: PathBuf::from(&self.tls.private_key),
                certificate: PathBuf::from(&self.tls.certificate),
                passphrase: self.tls.passphrase.clone(),
            },
            poll_timeout: Duration::from_millis(self.server.poll_timeout_ms),
            listen_backlog: self.server.listen_backlog,
            backlog_dir: self.server.backlog_dir.clone().unwrap_or(defaults.backlog_dir),
        })
    }
}
