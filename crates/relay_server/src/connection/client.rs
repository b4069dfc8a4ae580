//! The handler-facing view of a connection.

use super::{Connection, ConnectionInner, SendStatus};
use crate::ServerError;
use relay_event_system::{ClientConnection, ConnectionId, EventError, Payload};
use std::any::Any;
use std::net::SocketAddr;

impl ConnectionInner {
    fn upgrade(&self) -> Option<Connection> {
        self.self_ref.upgrade().map(|inner| Connection { inner })
    }
}

impl ClientConnection for ConnectionInner {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn send(&self, payload: Payload) -> Result<bool, EventError> {
        let connection = self.upgrade().ok_or(EventError::ConnectionGone)?;
        match connection.send(payload, false) {
            Ok(status) => Ok(status == SendStatus::Sent),
            Err(ServerError::Event(e)) => Err(e),
            Err(e) => Err(EventError::HandlerExecution(e.to_string())),
        }
    }

    fn close(&self) {
        if let Some(connection) = self.upgrade() {
            connection.close();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
