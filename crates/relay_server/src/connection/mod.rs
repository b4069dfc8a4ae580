//! Per-socket connection state machine.
//!
//! A [`Connection`] is created for every accepted socket and lives in the
//! server's connection table until it is destroyed. It buffers inbound bytes
//! until the server reports a complete frame, keeps an outbound queue for
//! writes the socket could not take, and raises lifecycle events through the
//! server's emitter.

mod client;

use crate::config::{Protocol, READ_BUFFER_SIZE};
use crate::protocol::{find_websocket_key, MAX_PACKAGE_SIZE, MAX_SEND_BUFFER_SIZE, BINARY_TYPE_BLOB};
use crate::reactor::{Callback, EventType, HandleId, Negotiation, Reactor};
use crate::server::{Encoded, ServerShared};
use crate::ServerError;
use relay_event_system::{ClientConnection, ConnectionId, Event, EventKind, Payload};
use serde_json::Value;
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, trace, warn};

/// Connection lifecycle. Variants are ordered; the status only moves
/// forward except when a `connecting` or `disconnecting` handler vetoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Status {
    Initial = 0,
    Connecting = 1,
    HandshakeEstablished = 2,
    Established = 3,
    Closing = 4,
    Closed = 8,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// What happened to data handed to [`Connection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Written to the socket in full.
    Sent,
    /// Held in the outbound queue or staged until the handshake completes.
    Queued,
    /// A `*-sending` handler stopped the write.
    Vetoed,
    /// Refused: connection closing, buffer full or socket dead.
    Rejected,
}

/// Frame reassembly and pre-handshake staging.
#[derive(Debug, Default)]
pub(crate) struct FrameState {
    pub(crate) handshake_done: bool,
    /// Length of a buffered non-final frame still to be consumed, or 0.
    pub(crate) partial_len: usize,
    /// Decoded payload of the non-final frames seen so far.
    pub(crate) assembly: Vec<u8>,
    /// Frames encoded before the handshake completed.
    pub(crate) pending: Vec<u8>,
    pub(crate) opcode_byte: Option<u8>,
}

#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub(crate) protocol: Protocol,
    pub(crate) status: Status,
    pub(crate) inbound: Vec<u8>,
    /// Length of the next package once known, 0 otherwise.
    pub(crate) packet_len: usize,
    pub(crate) outbound: Vec<u8>,
    pub(crate) frame: FrameState,
    writer_registered: bool,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    handle: HandleId,
    remote_addr: Option<SocketAddr>,
    reactor: Reactor,
    server: Weak<ServerShared>,
    self_ref: Weak<ConnectionInner>,
    state: RefCell<ConnectionState>,
    extensions: RefCell<HashMap<String, Value>>,
}

/// Shared handle to one client connection.
///
/// Cloning is cheap; all clones refer to the same connection. The server's
/// table holds the owning clone, so a connection that has been destroyed
/// only lives on while some caller still holds a clone.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnectionInner>,
}

impl Connection {
    /// Wraps an accepted socket and registers its read callback.
    pub(crate) fn new(
        id: ConnectionId,
        handle: HandleId,
        protocol: Protocol,
        reactor: Reactor,
        server: Weak<ServerShared>,
    ) -> Self {
        let remote_addr = reactor.peer_addr(handle);
        let status = if reactor.is_alive(handle) {
            Status::Connecting
        } else {
            error!("Connection {} accepted a socket that is already gone", id);
            Status::Initial
        };

        let inner = Rc::new_cyclic(|self_ref| ConnectionInner {
            id,
            handle,
            remote_addr,
            reactor,
            server,
            self_ref: self_ref.clone(),
            state: RefCell::new(ConnectionState {
                protocol,
                status,
                inbound: Vec::new(),
                packet_len: 0,
                outbound: Vec::new(),
                frame: FrameState::default(),
                writer_registered: false,
            }),
            extensions: RefCell::new(HashMap::new()),
        });
        let connection = Self { inner };

        let weak = connection.inner.self_ref.clone();
        let on_read: Callback = Rc::new(move |_| {
            if let Some(inner) = weak.upgrade() {
                Connection { inner }.base_read();
            }
        });
        if let Err(e) = connection.inner.reactor.on(EventType::Read, Some(handle), on_read) {
            error!("Failed to register reader for connection {}: {}", id, e);
        }

        connection
    }

    /// Raises `connecting`; a handler that stops propagation closes the
    /// connection again.
    pub(crate) fn announce(&self) {
        let vetoed = self
            .dispatch(EventKind::Connecting, Vec::new())
            .is_some_and(|event| event.is_propagation_stopped());
        if vetoed {
            debug!("Connection {} refused by a connecting handler", self.id());
            self.close();
        }
    }

    /// Recovers the connection an event was raised for.
    pub fn from_event(event: &Event) -> Option<Connection> {
        let connection = event.connection()?;
        let inner = connection.as_any().downcast_ref::<ConnectionInner>()?;
        inner.self_ref.upgrade().map(|inner| Connection { inner })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn handle(&self) -> HandleId {
        self.inner.handle
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn status(&self) -> Status {
        self.inner.state.borrow().status
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.state.borrow().protocol
    }

    /// Bytes waiting in the outbound queue.
    pub fn buffered_amount(&self) -> usize {
        self.inner.state.borrow().outbound.len()
    }

    /// Bytes received but not yet consumed as a frame.
    pub fn inbound_len(&self) -> usize {
        self.inner.state.borrow().inbound.len()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.inner.extensions.borrow_mut().insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.inner.extensions.borrow().get(key).cloned()
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.inner.extensions.borrow_mut().remove(key)
    }

    pub(crate) fn state(&self) -> &RefCell<ConnectionState> {
        &self.inner.state
    }

    pub(crate) fn state_ref(&self) -> Ref<'_, ConnectionState> {
        self.inner.state.borrow()
    }

    fn set_status(&self, status: Status) -> Status {
        mem::replace(&mut self.inner.state.borrow_mut().status, status)
    }

    fn server(&self) -> Option<Rc<ServerShared>> {
        self.inner.server.upgrade()
    }

    fn dispatch(&self, kind: EventKind, raw: Vec<u8>) -> Option<Event> {
        let server = self.server()?;
        let weak: Weak<dyn ClientConnection> = self.inner.self_ref.clone();
        Some(server.emitter().dispatch(kind, Some(weak), raw))
    }

    /// Read callback.
    fn base_read(&self) {
        let (protocol, status) = {
            let state = self.state_ref();
            (state.protocol, state.status)
        };
        let handle = self.inner.handle;

        if protocol.negotiates_tls() && status < Status::HandshakeEstablished {
            match self.inner.reactor.enable_tls(handle) {
                Negotiation::Pending => return,
                Negotiation::Established => {
                    debug!("TLS established for connection {}", self.id());
                    self.set_status(Status::HandshakeEstablished);
                    if self.buffered_amount() > 0 {
                        self.ensure_writer();
                    }
                }
                Negotiation::Failed { plaintext } => {
                    if protocol == Protocol::Auto && find_websocket_key(&plaintext).is_some() {
                        debug!("Connection {} spoke plain HTTP, continuing without TLS", self.id());
                        self.inner.state.borrow_mut().protocol = Protocol::Ws;
                        let eof = self.inner.reactor.is_eof(handle);
                        self.check_buffer(plaintext, eof);
                    } else {
                        warn!("TLS negotiation failed for connection {}", self.id());
                        self.destroy();
                    }
                    return;
                }
            }
        }

        match self.inner.reactor.read(handle, READ_BUFFER_SIZE) {
            Ok(bytes) => {
                let eof = self.inner.reactor.is_eof(handle);
                self.check_buffer(bytes, eof);
            }
            Err(e) => {
                warn!("Read failed on connection {}: {}", self.id(), e);
                self.destroy();
            }
        }
    }

    /// Appends `bytes` and dispatches every complete package.
    fn check_buffer(&self, bytes: Vec<u8>, eof: bool) {
        if bytes.is_empty() {
            if eof {
                debug!("Connection {} reached end of stream", self.id());
                self.destroy();
            }
            return;
        }
        trace!("Connection {} buffered {} bytes", self.id(), bytes.len());
        self.inner.state.borrow_mut().inbound.extend_from_slice(&bytes);

        let Some(server) = self.server() else {
            return;
        };

        loop {
            let (status, buffered, known_len) = {
                let state = self.state_ref();
                (state.status, state.inbound.len(), state.packet_len)
            };
            if status >= Status::Closing || buffered == 0 {
                break;
            }

            let packet_len = if known_len == 0 {
                let computed = server.packlen(self);
                if computed == 0 {
                    break;
                }
                if computed > MAX_PACKAGE_SIZE {
                    warn!("Connection {} announced a {} byte package", self.id(), computed);
                    self.destroy();
                    return;
                }
                self.inner.state.borrow_mut().packet_len = computed;
                computed
            } else {
                known_len
            };

            let package: Vec<u8> = {
                let mut state = self.inner.state.borrow_mut();
                if state.status >= Status::Closing || packet_len > state.inbound.len() {
                    break;
                }
                state.packet_len = 0;
                state.inbound.drain(..packet_len).collect()
            };

            let message = server.decode(self, &package);
            self.dispatch(EventKind::MessageReceived, message);
        }
    }

    /// Sends `payload`, framing it unless `raw` is set.
    ///
    /// Sequences and mappings are serialized to JSON first. Data sent before
    /// the handshake completes is staged and flushed once it does.
    pub fn send(&self, payload: impl Into<Payload>, raw: bool) -> Result<SendStatus, ServerError> {
        if self.status() >= Status::Closing {
            debug!("Send on closing connection {} ignored", self.id());
            return Ok(SendStatus::Rejected);
        }

        let message = payload.into().into_bytes()?;
        let frame = if raw {
            message.clone()
        } else {
            let Some(server) = self.server() else {
                return Ok(SendStatus::Rejected);
            };
            match server.encode(self, &Payload::Scalar(message.clone()))? {
                Encoded::Frame(frame) => frame,
                Encoded::Staged => return Ok(SendStatus::Queued),
                Encoded::Overflow => return Ok(SendStatus::Rejected),
            }
        };

        Ok(self.send_bytes(frame, message, EventKind::MessageSending, EventKind::MessageSended))
    }

    fn send_bytes(&self, frame: Vec<u8>, message: Vec<u8>, before: EventKind, after: EventKind) -> SendStatus {
        let (status, queue_busy) = {
            let state = self.state_ref();
            (state.status, !state.outbound.is_empty())
        };

        if status < Status::Established {
            return self.put_send(&frame);
        }
        if queue_busy {
            let queued = self.put_send(&frame);
            self.ensure_writer();
            return queued;
        }
        self.write_direct(frame, message, before, after)
    }

    fn write_direct(&self, frame: Vec<u8>, message: Vec<u8>, before: EventKind, after: EventKind) -> SendStatus {
        let vetoed = self
            .dispatch(before, message.clone())
            .is_some_and(|event| event.is_propagation_stopped());
        if vetoed {
            debug!("{} vetoed on connection {}", before, self.id());
            return SendStatus::Vetoed;
        }
        if self.status() == Status::Closed {
            return SendStatus::Rejected;
        }

        let handle = self.inner.handle;
        match self.inner.reactor.write(handle, &frame) {
            Ok(written) if written == frame.len() => {
                trace!("Connection {} wrote {} bytes", self.id(), written);
                self.dispatch(after, message);
                SendStatus::Sent
            }
            Ok(0) if !self.inner.reactor.is_alive(handle) => {
                debug!("Connection {} is gone, dropping send", self.id());
                self.destroy();
                SendStatus::Rejected
            }
            Ok(written) => {
                let queued = self.put_send(&frame[written..]);
                if queued == SendStatus::Rejected && written > 0 {
                    error!("Connection {} lost the tail of a partially written frame", self.id());
                    self.destroy();
                    return SendStatus::Rejected;
                }
                self.ensure_writer();
                queued
            }
            Err(e) => {
                warn!("Write failed on connection {}: {}", self.id(), e);
                self.destroy();
                SendStatus::Rejected
            }
        }
    }

    /// Appends to the outbound queue, refusing data that would reach the cap.
    fn put_send(&self, data: &[u8]) -> SendStatus {
        let mut state = self.inner.state.borrow_mut();
        if MAX_SEND_BUFFER_SIZE <= state.outbound.len() + data.len() {
            warn!(
                "Outbound buffer of connection {} is full ({} + {} bytes), dropping",
                self.id(),
                state.outbound.len(),
                data.len()
            );
            return SendStatus::Rejected;
        }
        state.outbound.extend_from_slice(data);
        SendStatus::Queued
    }

    pub(crate) fn ensure_writer(&self) {
        if self.inner.state.borrow().writer_registered {
            return;
        }

        let weak = self.inner.self_ref.clone();
        let on_write: Callback = Rc::new(move |_| {
            if let Some(inner) = weak.upgrade() {
                Connection { inner }.base_write();
            }
        });
        match self.inner.reactor.on(EventType::Write, Some(self.inner.handle), on_write) {
            Ok(_) => self.inner.state.borrow_mut().writer_registered = true,
            Err(e) => warn!("Failed to register writer for connection {}: {}", self.id(), e),
        }
    }

    fn stop_writer(&self) {
        self.inner.reactor.off(EventType::Write, Some(self.inner.handle));
        self.inner.state.borrow_mut().writer_registered = false;
    }

    /// Write callback: drains the outbound queue.
    fn base_write(&self) {
        let handle = self.inner.handle;
        let written = {
            let state = self.state_ref();
            if state.outbound.is_empty() {
                None
            } else {
                Some(self.inner.reactor.write(handle, &state.outbound))
            }
        };

        let drained = match written {
            None => true,
            Some(Ok(0)) => {
                if !self.inner.reactor.is_alive(handle) {
                    debug!("Connection {} died with {} bytes queued", self.id(), self.buffered_amount());
                    self.destroy();
                }
                return;
            }
            Some(Ok(count)) => {
                let mut state = self.inner.state.borrow_mut();
                state.outbound.drain(..count);
                trace!("Connection {} flushed {} bytes, {} left", self.id(), count, state.outbound.len());
                state.outbound.is_empty()
            }
            Some(Err(e)) => {
                warn!("Write failed on connection {}: {}", self.id(), e);
                self.destroy();
                return;
            }
        };

        if drained {
            self.stop_writer();
            if self.status() == Status::Closing {
                self.destroy();
            }
        }
    }

    /// Finishes the opening handshake.
    ///
    /// # Arguments
    ///
    /// * `response` - Complete `101 Switching Protocols` response
    /// * `header_len` - Bytes of the HTTP request to drop from the inbound buffer
    pub(crate) fn complete_handshake(&self, response: &str, header_len: usize) {
        self.set_status(Status::HandshakeEstablished);

        let pending = {
            let mut state = self.inner.state.borrow_mut();
            let consumed = header_len.min(state.inbound.len());
            state.inbound.drain(..consumed);
            state.packet_len = 0;
            state.status = Status::Established;

            let pending = mem::take(&mut state.frame.pending);
            let opcode_byte = state.frame.opcode_byte.unwrap_or(BINARY_TYPE_BLOB);
            state.frame = FrameState {
                handshake_done: true,
                opcode_byte: Some(opcode_byte),
                ..FrameState::default()
            };
            pending
        };

        let upgrade = response.as_bytes().to_vec();
        self.send_bytes(
            upgrade.clone(),
            upgrade,
            EventKind::HandshakeSending,
            EventKind::HandshakeSended,
        );

        if !pending.is_empty() {
            trace!("Flushing {} staged bytes on connection {}", pending.len(), self.id());
            if let Err(e) = self.send(pending, true) {
                warn!("Failed to flush staged data on connection {}: {}", self.id(), e);
            }
        }

        if self.status() == Status::Established {
            info!("Connection {} established from {:?}", self.id(), self.remote_addr());
            self.dispatch(EventKind::Connected, Vec::new());
        }
    }

    /// Starts an orderly close. See [`Connection::close_with`].
    pub fn close(&self) {
        self.shutdown(None, false);
    }

    /// Sends a final payload, then closes.
    ///
    /// Queued output is still written before the socket is released. A
    /// `disconnecting` handler that stops propagation cancels the close.
    pub fn close_with(&self, payload: impl Into<Payload>, raw: bool) {
        self.shutdown(Some(payload.into()), raw);
    }

    fn shutdown(&self, payload: Option<Payload>, raw: bool) {
        if self.status() >= Status::Closing {
            return;
        }
        if let Some(payload) = payload {
            if let Err(e) = self.send(payload, raw) {
                warn!("Failed to send closing payload on connection {}: {}", self.id(), e);
            }
            if self.status() >= Status::Closing {
                return;
            }
        }

        let previous = self.set_status(Status::Closing);
        let vetoed = self
            .dispatch(EventKind::Disconnecting, Vec::new())
            .is_some_and(|event| event.is_propagation_stopped());
        if vetoed {
            debug!("Close of connection {} cancelled by a disconnecting handler", self.id());
            let mut state = self.inner.state.borrow_mut();
            if state.status == Status::Closing {
                state.status = previous;
            }
            return;
        }
        if self.status() != Status::Closing {
            return;
        }

        if self.buffered_amount() == 0 {
            self.destroy();
        } else {
            self.ensure_writer();
        }
    }

    /// Releases the socket and leaves the server's table. Idempotent.
    pub fn destroy(&self) {
        if self.set_status(Status::Closed) == Status::Closed {
            return;
        }

        let handle = self.inner.handle;
        self.inner.reactor.off_socket(handle);
        self.inner.reactor.close(handle);
        if let Some(server) = self.server() {
            server.remove_connection(self.id());
        }

        {
            let mut state = self.inner.state.borrow_mut();
            state.writer_registered = false;
            state.outbound.clear();
        }
        debug!("Connection {} destroyed", self.id());
        self.dispatch(EventKind::Disconnected, Vec::new());
    }

    /// Sends an empty ping control frame.
    pub fn ping(&self) -> Result<SendStatus, ServerError> {
        self.send(vec![0x89u8, 0x00], true)
    }

    /// Called for every pong control frame. Pongs need no reply.
    pub fn pong(&self) {
        trace!("Pong received on connection {}", self.id());
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("handle", &self.inner.handle)
            .field("remote_addr", &self.inner.remote_addr)
            .field("protocol", &state.protocol)
            .field("status", &state.status)
            .field("inbound", &state.inbound.len())
            .field("outbound", &state.outbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order_and_codes() {
        assert!(Status::Initial < Status::Connecting);
        assert!(Status::HandshakeEstablished < Status::Established);
        assert!(Status::Established < Status::Closing);
        assert!(Status::Closing < Status::Closed);
        assert_eq!(Status::Closed.code(), 8);
        assert_eq!(Status::HandshakeEstablished.code(), 2);
    }

    #[test]
    fn test_frame_state_starts_clean() {
        let frame = FrameState::default();
        assert!(!frame.handshake_done);
        assert_eq!(frame.partial_len, 0);
        assert!(frame.assembly.is_empty() && frame.pending.is_empty());
        assert_eq!(frame.opcode_byte, None);
    }
}
