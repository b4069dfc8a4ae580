//! The emitter: listener list, route-building DSL and dispatch.

use crate::{
    ClientConnection, Event, EventError, EventKind, HandlerRef, HandlerRegistry, Listener, Route,
    RouteListener, RouteTable,
};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{error, trace};

/// Dispatch counters, as reported by [`Emitter::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitterStats {
    pub listeners: usize,
    pub events_dispatched: u64,
    pub listener_failures: u64,
}

/// Ordered listeners plus the DSL used to register them.
///
/// Every registration call (`when`, a typed helper, `build`) appends one new
/// listener, so dispatch order is registration order.
#[derive(Clone, Default)]
pub struct Emitter {
    listeners: Vec<Rc<dyn Listener>>,
    groups: Vec<String>,
    registry: HandlerRegistry,
    dispatched: Cell<u64>,
    failures: Cell<u64>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an emitter that resolves named handler references in `registry`.
    pub fn with_registry(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Runs `f` with `prefix` as the active group pattern.
    ///
    /// Groups nest, but only the innermost prefix is joined onto patterns
    /// registered inside it.
    pub fn group<F>(&mut self, prefix: impl Into<String>, f: F)
    where
        F: FnOnce(&mut Emitter),
    {
        self.groups.push(prefix.into());
        f(self);
        self.groups.pop();
    }

    /// Registers a `message-received` route.
    ///
    /// Returns `Ok(false)` without registering anything when the resulting
    /// pattern is empty.
    pub fn when(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::MessageReceived, pattern, handler.into())
    }

    /// Builds one listener from a whole route table.
    pub fn build(&mut self, routes: RouteTable) -> Result<(), EventError> {
        let listener = RouteListener::build(routes, &self.registry)?;
        self.listeners.push(Rc::new(listener));
        Ok(())
    }

    /// Appends a custom listener.
    pub fn push<L: Listener + 'static>(&mut self, listener: L) {
        self.listeners.push(Rc::new(listener));
    }

    pub fn push_shared(&mut self, listener: Rc<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn connecting(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::Connecting, pattern, handler.into())
    }

    pub fn connected(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::Connected, pattern, handler.into())
    }

    pub fn handshake_sending(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::HandshakeSending, pattern, handler.into())
    }

    pub fn handshake_sended(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::HandshakeSended, pattern, handler.into())
    }

    pub fn sending(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::MessageSending, pattern, handler.into())
    }

    pub fn sended(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::MessageSended, pattern, handler.into())
    }

    pub fn receiving(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::MessageReceived, pattern, handler.into())
    }

    pub fn disconnecting(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::Disconnecting, pattern, handler.into())
    }

    pub fn disconnected(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::Disconnected, pattern, handler.into())
    }

    pub fn backlog(&mut self, pattern: &str, handler: impl Into<HandlerRef>) -> Result<bool, EventError> {
        self.add_type(EventKind::Backlog, pattern, handler.into())
    }

    fn add_type(&mut self, kind: EventKind, pattern: &str, handler: HandlerRef) -> Result<bool, EventError> {
        let pattern = self.scoped(pattern);
        if pattern.is_empty() {
            return Ok(false);
        }

        self.build(RouteTable::new().on(kind.as_str(), Route::new(pattern, handler)))?;
        Ok(true)
    }

    fn scoped(&self, pattern: &str) -> String {
        match self.groups.last() {
            Some(prefix) => format!("{prefix}&&{pattern}"),
            None => pattern.to_string(),
        }
    }

    /// Builds an [`Event`] and hands it to every listener that handles `kind`.
    ///
    /// A stopped event still reaches the remaining listeners; callers that
    /// offer a veto inspect [`Event::is_propagation_stopped`] on the returned
    /// value.
    pub fn dispatch(
        &self,
        kind: EventKind,
        connection: Option<Weak<dyn ClientConnection>>,
        raw: impl Into<Vec<u8>>,
    ) -> Event {
        let event = Event::new(kind, connection, raw);
        self.dispatched.set(self.dispatched.get() + 1);
        trace!("Dispatching {} to {} listener(s)", kind, self.listeners.len());

        for listener in &self.listeners {
            if !listener.handles(kind) {
                continue;
            }
            if let Err(e) = listener.handle(&event) {
                self.failures.set(self.failures.get() + 1);
                error!("Listener '{}' failed on {}: {}", listener.listener_name(), kind, e);
            }
        }

        event
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            listeners: self.listeners.len(),
            events_dispatched: self.dispatched.get(),
            listener_failures: self.failures.get(),
        }
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listeners.len())
            .field("groups", &self.groups)
            .field("registry", &self.registry)
            .finish()
    }
}
