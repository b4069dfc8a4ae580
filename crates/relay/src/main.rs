//! Main application entry point for the Relay WebSocket server
//!
//! Provides the CLI, configuration loading and the two subcommands:
//! `start` runs the server, `send` queues a message in the backlog of a
//! server configured with the same listen address.

mod cli;
mod config;
mod logging;
mod routes;

use anyhow::{bail, Context, Result};
use cli::{CliArgs, CliCommand, ListenOverrides, SendArgs};
use config::AppConfig;
use relay_server::{Backlog, WebSocketServer};
use serde_json::Value;
use tracing::info;

/// Resolves the effective configuration.
///
/// Precedence, lowest first: defaults, the TOML file, `WS_*` environment
/// variables, command-line flags. A missing file is written out with the
/// defaults only when `create_missing` is set.
fn load_config(args: &CliArgs, overrides: &ListenOverrides, create_missing: bool) -> Result<AppConfig> {
    let mut config = if create_missing {
        AppConfig::load_from_file(&args.config_path)?
    } else {
        AppConfig::load_or_default(&args.config_path)?
    };
    config.apply_env()?;
    config.apply_overrides(overrides);

    if let Some(log_level) = &args.log_level {
        config.logging.level = log_level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    if let Err(e) = config.validate() {
        bail!("Configuration validation failed: {}", e);
    }
    Ok(config)
}

/// Display the startup banner
fn display_banner() {
    println!(
        r#"
  ____       _
 |  _ \ ___ | | __ _ _   _
 | |_) / _ \| |/ _` | | | |
 |  _ <  __/| | (_| | |_| |
 |_| \_\___||_|\__,_|\__, |
                     |___/   v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}

/// The `start` subcommand: a configured server with the default routes.
pub struct Application {
    config: AppConfig,
    server: WebSocketServer,
}

impl Application {
    pub fn new(config: AppConfig) -> Result<Self> {
        let server = WebSocketServer::new(config.to_server_config()?)
            .context("Failed to create WebSocket server")?;
        server
            .routes(routes::register)
            .context("Failed to register routes")?;

        Ok(Self { config, server })
    }

    /// Binds the listener and runs the reactor until shutdown.
    pub fn run(self) -> Result<()> {
        info!("📋 Configuration Summary:");
        info!("  🌐 Listen: {}:{}{}", self.config.server.host, self.config.server.port, self.config.server.path);
        info!("  🔐 Protocol: {}", self.config.server.protocol);
        info!("  📬 Backlog: {}", self.server.backlog().log_path().display());

        let address = self.server.bind().with_context(|| {
            format!(
                "Failed to bind {}:{}",
                self.config.server.host, self.config.server.port
            )
        })?;
        info!("🌟 Relay ready on {}", address);

        self.server.run().context("Server loop failed")?;

        let stats = self.server.emitter().stats();
        info!(
            "📊 Dispatched {} event(s), {} listener failure(s)",
            stats.events_dispatched, stats.listener_failures
        );
        Ok(())
    }
}

/// Builds the backlog message for `relay send`.
///
/// With `--type`, the message must be a JSON object and gains a `type`
/// member.
fn compose_message(send: &SendArgs) -> Result<Vec<u8>> {
    let Some(message_type) = &send.message_type else {
        return Ok(send.message.clone().into_bytes());
    };

    let mut value: Value = serde_json::from_str(&send.message)
        .context("--type requires MESSAGE to be a JSON object")?;
    match value.as_object_mut() {
        Some(object) => {
            object.insert("type".to_string(), Value::String(message_type.clone()));
        }
        None => bail!("--type requires MESSAGE to be a JSON object"),
    }
    Ok(serde_json::to_vec(&value)?)
}

/// The `send` subcommand: hands a message to a running server through the
/// backlog mailbox. No socket is opened.
fn send_message(config: &AppConfig, send: &SendArgs) -> Result<()> {
    let server_config = config.to_server_config()?;
    let message = compose_message(send)?;

    let backlog = Backlog::for_config(&server_config);
    let path = backlog
        .put(&message)
        .with_context(|| format!("Failed to queue message for {}", server_config.listen_url()))?;

    info!("📨 Queued {} byte(s) for {}", message.len(), server_config.listen_url());
    println!("{}", path.display());
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    match &args.command {
        CliCommand::Start(overrides) => {
            let config = load_config(&args, overrides, true)?;
            logging::setup_logging(&config.logging, args.json_logs)?;
            display_banner();

            info!("🚀 Relay v{} starting", env!("CARGO_PKG_VERSION"));
            info!("📂 Config: {}", args.config_path.display());

            let app = Application::new(config)?;
            app.run()?;
            info!("✅ Relay stopped");
        }
        CliCommand::Send(send) => {
            let config = load_config(&args, &send.listen, false)?;
            logging::setup_logging(&config.logging, args.json_logs)?;
            send_message(&config, send)?;
        }
    }

    Ok(())
}
