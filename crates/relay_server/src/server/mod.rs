//! The WebSocket server: listening socket, connection table, framing and
//! backlog.

mod codec;
mod core;
mod handle;

pub use self::core::WebSocketServer;
pub(crate) use self::core::ServerShared;
pub use handle::ServerHandle;

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ServerStatus {
    Starting = 1,
    Running = 2,
    Shutdown = 4,
}

/// Result of framing an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// Ready to write.
    Frame(Vec<u8>),
    /// Held until the handshake completes.
    Staged,
    /// The pre-handshake staging area is full; the message was dropped.
    Overflow,
}
