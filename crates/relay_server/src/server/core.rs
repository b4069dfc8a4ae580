//! Core server implementation.
//!
//! `WebSocketServer` owns the reactor, the listening socket and the table of
//! live connections. Everything runs on the thread that calls
//! [`WebSocketServer::run`] (or [`WebSocketServer::turn`]); handlers invoked
//! from the loop may call back into the server through a [`ServerHandle`].

use super::{Encoded, ServerHandle, ServerStatus};
use crate::backlog::Backlog;
use crate::config::{Protocol, ServerConfig};
use crate::connection::{Connection, SendStatus, Status};
use crate::reactor::{Callback, EventType, HandleId, Reactor};
use crate::{tls, ServerError};
use relay_event_system::{ConnectionId, Emitter, EventError, EventKind, Payload};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, warn};

/// State shared between the server, its connections and reactor callbacks.
pub(crate) struct ServerShared {
    config: ServerConfig,
    reactor: Reactor,
    emitter: RefCell<Rc<Emitter>>,
    connections: RefCell<BTreeMap<ConnectionId, Connection>>,
    next_id: Cell<ConnectionId>,
    listener: Cell<Option<HandleId>>,
    backlog: Backlog,
    status: Cell<ServerStatus>,
    /// Mode handed to new connections; `auto` degrades to `ws` without TLS material.
    protocol: Cell<Protocol>,
    self_ref: Weak<ServerShared>,
}

impl ServerShared {
    pub(crate) fn emitter(&self) -> Rc<Emitter> {
        self.emitter.borrow().clone()
    }

    pub(crate) fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    pub(crate) fn status(&self) -> ServerStatus {
        self.status.get()
    }

    pub(crate) fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.borrow().get(&id).cloned()
    }

    pub(crate) fn connections(&self) -> Vec<Connection> {
        self.connections.borrow().values().cloned().collect()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    pub(crate) fn remove_connection(&self, id: ConnectionId) {
        let removed = self.connections.borrow_mut().remove(&id);
        if removed.is_some() {
            debug!("Connection {} removed, {} remaining", id, self.connection_count());
        }
    }

    /// Sends `payload` to every established connection.
    ///
    /// Returns how many connections sent or queued it.
    pub(crate) fn broadcast(&self, payload: Payload) -> usize {
        let mut accepted = 0;
        for connection in self.connections() {
            if connection.status() != Status::Established {
                continue;
            }
            match connection.send(payload.clone(), false) {
                Ok(SendStatus::Sent | SendStatus::Queued) => accepted += 1,
                Ok(_) => {}
                Err(e) => warn!("Broadcast to connection {} failed: {}", connection.id(), e),
            }
        }
        accepted
    }

    /// Accepts every pending client on the listening socket.
    fn accept_pending(&self, listener: HandleId) {
        loop {
            match self.reactor.accept(listener) {
                Ok(Some((handle, peer))) => self.open_connection(handle, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    break;
                }
            }
        }
    }

    fn open_connection(&self, handle: HandleId, peer: SocketAddr) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let connection = Connection::new(
            id,
            handle,
            self.protocol.get(),
            self.reactor.clone(),
            self.self_ref.clone(),
        );
        self.connections.borrow_mut().insert(id, connection.clone());
        debug!("Connection {} accepted from {}", id, peer);

        connection.announce();
    }

    /// Dispatches every pending backlog entry as a `backlog` event.
    pub(crate) fn check_backlog(&self) -> Result<usize, ServerError> {
        let entries = self.backlog.take_pending()?;
        if entries.is_empty() {
            return Ok(0);
        }

        let emitter = self.emitter();
        let count = entries.len();
        for entry in entries {
            emitter.dispatch(EventKind::Backlog, None, entry);
        }
        debug!("Dispatched {} backlog entr{}", count, if count == 1 { "y" } else { "ies" });
        Ok(count)
    }
}

/// Single-threaded WebSocket server.
///
/// # Lifecycle
///
/// 1. Build with [`WebSocketServer::new`] and register routes with
///    [`WebSocketServer::routes`]
/// 2. [`WebSocketServer::bind`] opens the listening socket
/// 3. [`WebSocketServer::run`] drives the reactor until [`WebSocketServer::shutdown`]
///
/// [`WebSocketServer::start`] does steps 2 and 3 at once.
pub struct WebSocketServer {
    shared: Rc<ServerShared>,
}

impl WebSocketServer {
    /// Creates a server with an empty emitter.
    ///
    /// # Arguments
    ///
    /// * `config` - Listen address, transport mode and reactor tuning
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        Self::with_emitter(config, Emitter::new())
    }

    pub fn with_emitter(config: ServerConfig, emitter: Emitter) -> Result<Self, ServerError> {
        let reactor = Reactor::new(config.poll_timeout)?;
        let backlog = Backlog::for_config(&config);
        let protocol = config.protocol;

        let shared = Rc::new_cyclic(|self_ref| ServerShared {
            config,
            reactor,
            emitter: RefCell::new(Rc::new(emitter)),
            connections: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
            listener: Cell::new(None),
            backlog,
            status: Cell::new(ServerStatus::Starting),
            protocol: Cell::new(protocol),
            self_ref: self_ref.clone(),
        });

        Ok(Self { shared })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn reactor(&self) -> &Reactor {
        &self.shared.reactor
    }

    pub fn emitter(&self) -> Rc<Emitter> {
        self.shared.emitter()
    }

    /// Replaces the emitter used for all future dispatches.
    pub fn set_emitter(&self, emitter: Emitter) {
        *self.shared.emitter.borrow_mut() = Rc::new(emitter);
    }

    /// Registers routes.
    ///
    /// `register` receives the current emitter and a [`ServerHandle`] its
    /// handlers can capture to reach the server later.
    pub fn routes<F>(&self, register: F) -> Result<(), ServerError>
    where
        F: FnOnce(&mut Emitter, ServerHandle) -> Result<(), EventError>,
    {
        let mut emitter = (*self.shared.emitter()).clone();
        register(&mut emitter, self.handle())?;
        info!("Routes registered: {} listener(s)", emitter.listener_count());
        self.set_emitter(emitter);
        Ok(())
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle::new(Rc::downgrade(&self.shared), self.shared.backlog.clone())
    }

    /// Opens the listening socket and installs the accept and backlog
    /// callbacks. Calling it again returns the bound address.
    pub fn bind(&self) -> Result<SocketAddr, ServerError> {
        let shared = &self.shared;
        if let Some(listener) = shared.listener.get() {
            return shared.reactor.local_addr(listener).ok_or_else(|| {
                ServerError::Registration(format!("listening socket {listener} is gone"))
            });
        }
        if shared.status() == ServerStatus::Shutdown {
            return Err(ServerError::Config("server has been shut down".to_string()));
        }

        let config = &shared.config;
        let address = config.bind_address()?;
        info!("🚀 Starting WebSocket server on {} ({})", config.listen_url(), config.protocol);

        let mut protocol = config.protocol;
        let tls = if protocol.negotiates_tls() {
            match tls::load_server_config(&config.tls) {
                Ok(tls) => Some(tls),
                Err(e) if protocol == Protocol::Auto => {
                    warn!("TLS unavailable ({}), serving plain ws only", e);
                    protocol = Protocol::Ws;
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        shared.protocol.set(protocol);

        let listener = shared.reactor.open_with_backlog(address, tls, config.listen_backlog)?;
        shared.listener.set(Some(listener));

        let weak = Rc::downgrade(shared);
        let on_accept: Callback = Rc::new(move |target| {
            if let (Some(shared), Some(listener)) = (weak.upgrade(), target) {
                shared.accept_pending(listener);
            }
        });
        shared.reactor.on(EventType::Read, Some(listener), on_accept)?;

        let weak = Rc::downgrade(shared);
        let on_tick: Callback = Rc::new(move |_| {
            if let Some(shared) = weak.upgrade() {
                if let Err(e) = shared.check_backlog() {
                    error!("Failed to drain backlog: {}", e);
                }
            }
        });
        shared.reactor.on(EventType::Tick, None, on_tick)?;

        shared.status.set(ServerStatus::Running);
        let local = shared.reactor.local_addr(listener).unwrap_or(address);
        info!("✅ Listening on {} ({})", local, protocol);
        Ok(local)
    }

    /// Runs the loop until [`WebSocketServer::shutdown`] is called, binding
    /// first if needed.
    pub fn run(&self) -> Result<(), ServerError> {
        if self.shared.listener.get().is_none() {
            self.bind()?;
        }
        while self.shared.status() != ServerStatus::Shutdown {
            self.turn()?;
        }
        info!("Server stopped");
        Ok(())
    }

    /// Binds and runs.
    pub fn start(&self) -> Result<(), ServerError> {
        self.bind()?;
        self.run()
    }

    /// One reactor iteration.
    pub fn turn(&self) -> Result<(), ServerError> {
        self.shared.reactor.turn()
    }

    /// Closes every connection and the listening socket; [`WebSocketServer::run`]
    /// returns after the current iteration.
    pub fn shutdown(&self) {
        info!("🛑 Shutting down WebSocket server...");
        for connection in self.shared.connections() {
            connection.destroy();
        }
        if let Some(listener) = self.shared.listener.take() {
            self.shared.reactor.close(listener);
        }
        self.shared.reactor.off(EventType::Tick, None);
        self.shared.status.set(ServerStatus::Shutdown);
    }

    /// Sends `payload` to every established connection; returns how many
    /// sent or queued it.
    pub fn broadcast(&self, payload: impl Into<Payload>) -> usize {
        self.shared.broadcast(payload.into())
    }

    /// Frame length detection for one connection; `None` if it does not exist.
    pub fn packlen(&self, id: ConnectionId) -> Option<usize> {
        let connection = self.shared.connection(id)?;
        Some(self.shared.packlen(&connection))
    }

    pub fn handshake(&self, id: ConnectionId) -> Option<usize> {
        let connection = self.shared.connection(id)?;
        Some(self.shared.handshake(&connection))
    }

    pub fn encode(&self, id: ConnectionId, payload: &Payload) -> Result<Encoded, ServerError> {
        let connection = self
            .shared
            .connection(id)
            .ok_or_else(|| ServerError::Protocol(format!("unknown connection {id}")))?;
        self.shared.encode(&connection, payload)
    }

    pub fn decode(&self, id: ConnectionId, frame: &[u8]) -> Option<Vec<u8>> {
        let connection = self.shared.connection(id)?;
        Some(self.shared.decode(&connection, frame))
    }

    /// Drops a message into this server's backlog mailbox.
    pub fn put_backlog(&self, data: impl AsRef<[u8]>) -> Result<PathBuf, ServerError> {
        self.shared.backlog.put(data.as_ref())
    }

    /// Dispatches pending backlog entries now instead of on the next tick.
    pub fn check_backlog(&self) -> Result<usize, ServerError> {
        self.shared.check_backlog()
    }

    pub fn clear_backlog(&self) -> Result<(), ServerError> {
        self.shared.backlog.clear()
    }

    pub fn backlog(&self) -> &Backlog {
        self.shared.backlog()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.shared.connection(id)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.shared.connections()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }

    pub fn status(&self) -> ServerStatus {
        self.shared.status()
    }

    /// Protocol handed to new connections, after any TLS fallback.
    pub fn protocol(&self) -> Protocol {
        self.shared.protocol.get()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .listener
            .get()
            .and_then(|listener| self.shared.reactor.local_addr(listener))
    }
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("listen_url", &self.shared.config.listen_url())
            .field("status", &self.shared.status())
            .field("connections", &self.shared.connection_count())
            .finish()
    }
}
