//! Error type shared by the reactor, connections and server.

use relay_event_system::EventError;
use std::io;

/// Failures surfaced by the server engine.
///
/// Per-connection faults (`Protocol`, `Transport`) are normally contained by
/// closing the offending connection; they only reach a caller through direct
/// API use. `Bind` is fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Bad opcode, unmasked client frame, oversized message or malformed handshake
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Read or write failure on a socket
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),
    /// A non-scalar payload reached the frame encoder
    #[error("Encode error: {0}")]
    Encode(String),
    /// The listening socket could not be set up
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    /// Backlog mailbox read or write failure
    #[error("Backlog I/O error: {0}")]
    BacklogIo(io::Error),
    /// Certificate or key material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),
    /// A reactor registration named an unknown event or a wrong target
    #[error("Invalid registration: {0}")]
    Registration(String),
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
    /// Failure while registering routes or running handlers
    #[error("Event error: {0}")]
    Event(#[from] EventError),
}
