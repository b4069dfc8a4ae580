//! Weak handle to a running server, for capture in route handlers.

use super::ServerShared;
use crate::backlog::Backlog;
use crate::connection::Connection;
use crate::ServerError;
use relay_event_system::{ConnectionId, Payload};
use std::path::PathBuf;
use std::rc::Weak;

/// Clonable reference to a [`WebSocketServer`](super::WebSocketServer).
///
/// The handle does not keep the server alive. Once the server is dropped
/// lookups return nothing and broadcasts reach nobody; the backlog still
/// works since it only needs the mailbox location.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Weak<ServerShared>,
    backlog: Backlog,
}

impl ServerHandle {
    pub(crate) fn new(shared: Weak<ServerShared>, backlog: Backlog) -> Self {
        Self { shared, backlog }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    pub fn broadcast(&self, payload: impl Into<Payload>) -> usize {
        self.shared
            .upgrade()
            .map_or(0, |shared| shared.broadcast(payload.into()))
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.shared.upgrade()?.connection(id)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.upgrade().map_or(0, |shared| shared.connection_count())
    }

    pub fn put_backlog(&self, data: impl AsRef<[u8]>) -> Result<PathBuf, ServerError> {
        self.backlog.put(data.as_ref())
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("alive", &self.is_alive())
            .field("backlog", &self.backlog.log_path())
            .finish()
    }
}
