//! Logging setup for the Relay binary.

use crate::config::LoggingSettings;
use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. JSON output is
/// used when either the configuration or `--json-logs` asks for it.
///
/// # Arguments
///
/// * `config` - Logging section of the application configuration
/// * `json_format` - Force JSON output regardless of `config`
pub fn setup_logging(config: &LoggingSettings, json_format: bool) -> Result<()> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(fmt::layer().json().with_file(false).with_line_number(false))
            .try_init()
            .context("Failed to install JSON log subscriber")?;
    } else {
        registry
            .with(fmt::layer().with_ansi(true).with_file(false).with_line_number(false))
            .try_init()
            .context("Failed to install log subscriber")?;
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}
