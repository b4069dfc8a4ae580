//! Single-threaded readiness reactor.
//!
//! The reactor owns every socket and every callback registration. One
//! [`Reactor::turn`] performs a full iteration of the loop:
//!
//! 1. poll the sockets, waiting at most the configured timeout (no wait at
//!    all while some registered socket is still known to be ready);
//! 2. run every `tick` and `tick-once` callback, dropping the `tick-once`
//!    ones before they fire;
//! 3. run `read` callbacks for readable sockets, then `write`, then
//!    `except`, visiting sockets in the order they were opened.
//!
//! Callbacks run with no reactor state borrowed, so they may register,
//! deregister, read, write and close freely. A registration removed by an
//! earlier callback in the same turn is not invoked.

mod socket;

use crate::ServerError;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use rustls::ServerConfig;
use socket::SocketEntry;
use socket2::{Domain, Socket, Type};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::DEFAULT_LISTEN_BACKLOG;

/// Identifier of a socket owned by the reactor.
pub type HandleId = usize;

/// Identifier of one callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

/// Registration kinds understood by [`Reactor::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Read,
    Write,
    Except,
    Tick,
    TickOnce,
}

impl EventType {
    fn needs_target(self) -> bool {
        matches!(self, EventType::Read | EventType::Write | EventType::Except)
    }
}

impl FromStr for EventType {
    type Err = ServerError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "read" => Ok(EventType::Read),
            "write" => Ok(EventType::Write),
            "except" => Ok(EventType::Except),
            "tick" => Ok(EventType::Tick),
            "tick-once" | "tickonce" => Ok(EventType::TickOnce),
            other => Err(ServerError::Registration(format!("unknown event type '{other}'"))),
        }
    }
}

/// Callback invoked by the loop with the socket it concerns (`None` for ticks).
pub type Callback = Rc<dyn Fn(Option<HandleId>)>;

/// Outcome of a TLS negotiation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    Established,
    /// More bytes are needed.
    Pending,
    /// The peer did not speak TLS. `plaintext` holds every byte read during
    /// the attempt.
    Failed { plaintext: Vec<u8> },
}

struct Registration {
    kind: EventType,
    target: Option<HandleId>,
    callback: Callback,
}

struct ReactorCore {
    poll: Poll,
    events: Events,
    sockets: BTreeMap<HandleId, SocketEntry>,
    registrations: BTreeMap<EventId, Registration>,
    next_handle: HandleId,
    next_event: u64,
    poll_timeout: Duration,
}

impl ReactorCore {
    fn is_ready(&self, handle: HandleId, kind: EventType) -> bool {
        self.sockets.get(&handle).is_some_and(|socket| match kind {
            EventType::Read => socket.readable,
            EventType::Write => socket.writable,
            EventType::Except => socket.errored,
            EventType::Tick | EventType::TickOnce => false,
        })
    }

    /// Whether some registered callback already has work without polling.
    fn has_pending_readiness(&self) -> bool {
        self.registrations.values().any(|registration| {
            registration
                .target
                .is_some_and(|handle| self.is_ready(handle, registration.kind))
        })
    }

    fn register_socket(&mut self, mut entry: SocketEntry, interest: Interest) -> io::Result<HandleId> {
        let handle = self.next_handle;
        let token = Token(handle);
        match &mut entry.io {
            socket::SocketIo::Listener(listener) => self.poll.registry().register(listener, token, interest)?,
            socket::SocketIo::Stream(stream) => self.poll.registry().register(stream, token, interest)?,
        }
        self.next_handle += 1;
        self.sockets.insert(handle, entry);
        Ok(handle)
    }
}

/// Cheap, clonable handle to the reactor state.
#[derive(Clone)]
pub struct Reactor {
    core: Rc<RefCell<ReactorCore>>,
}

impl Reactor {
    pub fn new(poll_timeout: Duration) -> Result<Self, ServerError> {
        let core = ReactorCore {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            sockets: BTreeMap::new(),
            registrations: BTreeMap::new(),
            next_handle: 1,
            next_event: 1,
            poll_timeout,
        };
        Ok(Self {
            core: Rc::new(RefCell::new(core)),
        })
    }

    /// Opens a non-blocking listening socket on `address`.
    ///
    /// Streams accepted from it inherit `tls`, which [`Reactor::enable_tls`]
    /// uses to negotiate.
    pub fn open(&self, address: SocketAddr, tls: Option<Arc<ServerConfig>>) -> Result<HandleId, ServerError> {
        self.open_with_backlog(address, tls, DEFAULT_LISTEN_BACKLOG)
    }

    pub fn open_with_backlog(
        &self,
        address: SocketAddr,
        tls: Option<Arc<ServerConfig>>,
        backlog: i32,
    ) -> Result<HandleId, ServerError> {
        let bind_error = |source: io::Error| ServerError::Bind {
            address: address.to_string(),
            source,
        };

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, None).map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        if let Err(e) = socket.set_keepalive(true) {
            warn!("Failed to enable SO_KEEPALIVE on {}: {}", address, e);
        }
        socket.bind(&address.into()).map_err(bind_error)?;
        socket.listen(backlog).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener);

        let handle = self
            .core
            .borrow_mut()
            .register_socket(SocketEntry::listener(listener, tls), Interest::READABLE)
            .map_err(bind_error)?;

        info!("Listening socket {} opened on {}", handle, address);
        Ok(handle)
    }

    /// Accepts one pending connection from a listening socket.
    pub fn accept(&self, listener: HandleId) -> Result<Option<(HandleId, SocketAddr)>, ServerError> {
        let mut core = self.core.borrow_mut();
        let Some(entry) = core.sockets.get_mut(&listener) else {
            return Err(ServerError::Registration(format!("no socket with handle {listener}")));
        };
        let socket::SocketIo::Listener(tcp_listener) = &entry.io else {
            return Err(ServerError::Registration(format!("handle {listener} is not a listening socket")));
        };

        let (stream, peer) = match tcp_listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                entry.readable = false;
                return Ok(None);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(ServerError::Transport(e)),
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let tls = entry.tls_config.clone();
        let handle = core.register_socket(
            SocketEntry::stream(stream, peer, tls),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        trace!("Accepted {} as socket {}", peer, handle);
        Ok(Some((handle, peer)))
    }

    /// Registers a callback.
    ///
    /// `read`, `write` and `except` need an open socket as target; `tick`
    /// and `tick-once` must not have one.
    pub fn on(&self, kind: EventType, target: Option<HandleId>, callback: Callback) -> Result<EventId, ServerError> {
        let mut core = self.core.borrow_mut();

        match (kind.needs_target(), target) {
            (true, None) => {
                return Err(ServerError::Registration(format!("{kind:?} requires a target socket")));
            }
            (true, Some(handle)) if !core.sockets.contains_key(&handle) => {
                return Err(ServerError::Registration(format!("no socket with handle {handle}")));
            }
            (false, Some(_)) => {
                return Err(ServerError::Registration(format!("{kind:?} does not take a target socket")));
            }
            _ => {}
        }

        let id = EventId(core.next_event);
        core.next_event += 1;
        core.registrations.insert(id, Registration { kind, target, callback });
        Ok(id)
    }

    /// Whether a callback of `kind` is registered for `target`.
    pub fn is_registered(&self, kind: EventType, target: Option<HandleId>) -> bool {
        self.core
            .borrow()
            .registrations
            .values()
            .any(|registration| registration.kind == kind && registration.target == target)
    }

    /// Removes every `kind` registration for `target`.
    pub fn off(&self, kind: EventType, target: Option<HandleId>) {
        self.core
            .borrow_mut()
            .registrations
            .retain(|_, registration| !(registration.kind == kind && registration.target == target));
    }

    pub fn off_event(&self, id: EventId) {
        self.core.borrow_mut().registrations.remove(&id);
    }

    /// Removes every registration that targets `target`.
    pub fn off_socket(&self, target: HandleId) {
        self.core
            .borrow_mut()
            .registrations
            .retain(|_, registration| registration.target != Some(target));
    }

    /// Reads up to `max` bytes. An empty result with [`Reactor::is_eof`]
    /// false means nothing was available yet.
    pub fn read(&self, handle: HandleId, max: usize) -> io::Result<Vec<u8>> {
        let mut core = self.core.borrow_mut();
        let entry = core.sockets.get_mut(&handle).ok_or_else(|| not_open(handle))?;
        entry.read(max)
    }

    /// Writes what the socket accepts and returns the count; `Ok(0)` when it
    /// would block.
    pub fn write(&self, handle: HandleId, data: &[u8]) -> io::Result<usize> {
        let mut core = self.core.borrow_mut();
        let entry = core.sockets.get_mut(&handle).ok_or_else(|| not_open(handle))?;
        entry.write(data)
    }

    /// Drops the socket and every registration that targets it.
    pub fn close(&self, handle: HandleId) {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        core.registrations.retain(|_, registration| registration.target != Some(handle));

        let Some(mut entry) = core.sockets.remove(&handle) else {
            return;
        };
        entry.shutdown_tls();
        let deregistered = match &mut entry.io {
            socket::SocketIo::Listener(listener) => core.poll.registry().deregister(listener),
            socket::SocketIo::Stream(stream) => core.poll.registry().deregister(stream),
        };
        if let Err(e) = deregistered {
            debug!("Failed to deregister socket {}: {}", handle, e);
        }
        trace!("Socket {} closed", handle);
    }

    pub fn is_alive(&self, handle: HandleId) -> bool {
        self.core
            .borrow()
            .sockets
            .get(&handle)
            .is_some_and(SocketEntry::is_alive)
    }

    pub fn is_eof(&self, handle: HandleId) -> bool {
        self.core.borrow().sockets.get(&handle).map_or(true, |entry| entry.eof)
    }

    pub fn peer_addr(&self, handle: HandleId) -> Option<SocketAddr> {
        self.core.borrow().sockets.get(&handle).and_then(|entry| entry.peer)
    }

    pub fn local_addr(&self, handle: HandleId) -> Option<SocketAddr> {
        self.core
            .borrow()
            .sockets
            .get(&handle)
            .and_then(|entry| entry.local_addr().ok())
    }

    /// Runs one step of the server-side TLS handshake on an accepted socket.
    pub fn enable_tls(&self, handle: HandleId) -> Negotiation {
        let mut core = self.core.borrow_mut();
        match core.sockets.get_mut(&handle) {
            Some(entry) => entry.negotiate(),
            None => Negotiation::Failed { plaintext: Vec::new() },
        }
    }

    pub fn socket_count(&self) -> usize {
        self.core.borrow().sockets.len()
    }

    pub fn registration_count(&self) -> usize {
        self.core.borrow().registrations.len()
    }

    /// Runs the loop forever. Only a failing poll ends it.
    pub fn run(&self) -> Result<(), ServerError> {
        loop {
            self.turn()?;
        }
    }

    /// Performs exactly one loop iteration.
    pub fn turn(&self) -> Result<(), ServerError> {
        self.poll_once()?;
        self.fire_ticks();
        self.fire_sockets(EventType::Read);
        self.fire_sockets(EventType::Write);
        self.fire_sockets(EventType::Except);
        Ok(())
    }

    fn poll_once(&self) -> Result<(), ServerError> {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;

        let timeout = if core.has_pending_readiness() {
            Duration::ZERO
        } else {
            core.poll_timeout
        };

        match core.poll.poll(&mut core.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(ServerError::Transport(e)),
        }

        for event in core.events.iter() {
            let Some(entry) = core.sockets.get_mut(&event.token().0) else {
                continue;
            };
            if event.is_readable() || event.is_read_closed() {
                entry.readable = true;
            }
            if event.is_writable() || event.is_write_closed() {
                entry.writable = true;
            }
            if event.is_error() {
                entry.errored = true;
                entry.readable = true;
            }
        }

        for (handle, entry) in core.sockets.iter_mut() {
            if entry.writable {
                if let Err(e) = entry.flush_pending_tls() {
                    debug!("Failed to flush TLS records on socket {}: {}", handle, e);
                    entry.errored = true;
                }
            }
        }

        Ok(())
    }

    fn fire_ticks(&self) {
        let due: Vec<(EventId, bool, Callback)> = {
            let mut core = self.core.borrow_mut();
            let due: Vec<(EventId, bool, Callback)> = core
                .registrations
                .iter()
                .filter(|(_, registration)| matches!(registration.kind, EventType::Tick | EventType::TickOnce))
                .map(|(id, registration)| {
                    (*id, registration.kind == EventType::TickOnce, registration.callback.clone())
                })
                .collect();
            for (id, once, _) in &due {
                if *once {
                    core.registrations.remove(id);
                }
            }
            due
        };

        for (id, once, callback) in due {
            if once || self.core.borrow().registrations.contains_key(&id) {
                callback(None);
            }
        }
    }

    fn fire_sockets(&self, kind: EventType) {
        let mut due: Vec<(HandleId, EventId, Callback)> = {
            let core = self.core.borrow();
            core.registrations
                .iter()
                .filter(|(_, registration)| registration.kind == kind)
                .filter_map(|(id, registration)| {
                    let handle = registration.target?;
                    core.is_ready(handle, kind)
                        .then(|| (handle, *id, registration.callback.clone()))
                })
                .collect()
        };
        due.sort_by_key(|(handle, id, _)| (*handle, *id));

        for (handle, id, callback) in due {
            let still_registered = self.core.borrow().registrations.contains_key(&id);
            if still_registered {
                callback(Some(handle));
            }
        }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("Reactor")
            .field("sockets", &core.sockets.len())
            .field("registrations", &core.registrations.len())
            .field("poll_timeout", &core.poll_timeout)
            .finish()
    }
}

fn not_open(handle: HandleId) -> io::Error {
    io::Error::new(ErrorKind::NotFound, format!("socket {handle} is not open"))
}
