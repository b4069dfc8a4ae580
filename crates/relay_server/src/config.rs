//! Server configuration types and defaults.
//!
//! This module contains the listen address, transport mode and reactor
//! tuning values used to build a [`WebSocketServer`](crate::WebSocketServer).

use crate::ServerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Bytes requested from a socket per read.
pub const READ_BUFFER_SIZE: usize = 65535;

/// Default length of the OS accept queue.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 102400;

/// Transport mode of the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain TCP.
    Ws,
    /// TLS only.
    Wss,
    /// TLS, falling back to plain when the client opens with an HTTP upgrade.
    Auto,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Auto => "auto",
        }
    }

    /// Whether connections in this mode start with a TLS negotiation attempt.
    pub fn negotiates_tls(self) -> bool {
        matches!(self, Protocol::Wss | Protocol::Auto)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ServerError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            "auto" => Ok(Protocol::Auto),
            other => Err(ServerError::Config(format!(
                "Unknown protocol '{other}', expected ws, wss or auto"
            ))),
        }
    }
}

/// PEM material for `wss` and `auto` listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub private_key: PathBuf,
    pub certificate: PathBuf,
    /// Passphrase for an encrypted key. Encrypted keys are not supported;
    /// setting this only produces a warning.
    pub passphrase: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            private_key: PathBuf::from("private_key.key"),
            certificate: PathBuf::from("certificate.pem"),
            passphrase: None,
        }
    }
}

/// Configuration structure for the WebSocket server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Host name or address to listen on
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Advertised path; part of the canonical listen address
    pub path: String,

    pub protocol: Protocol,

    pub tls: TlsConfig,

    /// Upper bound of each reactor poll wait
    pub poll_timeout: Duration,

    /// Length of the OS accept queue
    pub listen_backlog: i32,

    /// Root directory of the backlog mailbox
    pub backlog_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            path: "/".to_string(),
            protocol: Protocol::Auto,
            tls: TlsConfig::default(),
            poll_timeout: Duration::from_millis(10),
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            backlog_dir: std::env::temp_dir().join("relay"),
        }
    }
}

impl ServerConfig {
    /// Canonical `tcp://host:port/path` address.
    ///
    /// Two processes configured with the same host, port and path agree on
    /// this string, which keys the backlog mailbox they share.
    pub fn listen_url(&self) -> String {
        format!(
            "tcp://{}:{}/{}",
            self.host,
            self.port,
            self.path.trim_start_matches('/')
        )
    }

    /// Resolves host and port to the first matching socket address.
    pub fn bind_address(&self) -> Result<SocketAddr, ServerError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ServerError::Config(format!("Cannot resolve {}:{}: {e}", self.host, self.port)))?
            .next()
            .ok_or_else(|| ServerError::Config(format!("No address found for {}:{}", self.host, self.port)))
    }
}
