//! Listeners and the route tables they are built from.

use crate::{Event, EventError, EventHandler, EventKind, HandlerRef, HandlerRegistry};
use std::rc::Rc;
use tracing::{debug, warn};

/// Receives every event the emitter dispatches.
///
/// `handles` plays the role of "this listener declares a method for that
/// event type": the emitter skips listeners that return `false`.
pub trait Listener {
    fn handles(&self, kind: EventKind) -> bool;

    fn handle(&self, event: &Event) -> Result<(), EventError>;

    fn listener_name(&self) -> &str {
        "listener"
    }
}

/// Key of a route table entry: one event type, or the `all`/`*` wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKey {
    Any,
    Kind(EventKind),
}

impl TriggerKey {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "*" | "all" => Some(TriggerKey::Any),
            other => other.parse().ok().map(TriggerKey::Kind),
        }
    }

    pub fn applies_to(self, kind: EventKind) -> bool {
        match self {
            TriggerKey::Any => true,
            TriggerKey::Kind(own) => own == kind,
        }
    }
}

/// A pattern and the handler to run when it matches.
#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: String,
    pub handler: HandlerRef,
}

impl Route {
    pub fn new(pattern: impl Into<String>, handler: impl Into<HandlerRef>) -> Self {
        Self {
            pattern: pattern.into(),
            handler: handler.into(),
        }
    }
}

/// The accepted shapes of a route table value.
#[derive(Debug, Clone)]
pub enum RouteSpec {
    Single(Route),
    Many(Vec<Route>),
    /// A handler with no pattern; it matches everything.
    Bare(HandlerRef),
}

impl RouteSpec {
    fn into_routes(self) -> Vec<Route> {
        match self {
            RouteSpec::Single(route) => vec![route],
            RouteSpec::Many(routes) => routes,
            RouteSpec::Bare(handler) => vec![Route::new("*", handler)],
        }
    }
}

impl From<Route> for RouteSpec {
    fn from(route: Route) -> Self {
        RouteSpec::Single(route)
    }
}

impl From<Vec<Route>> for RouteSpec {
    fn from(routes: Vec<Route>) -> Self {
        RouteSpec::Many(routes)
    }
}

impl From<HandlerRef> for RouteSpec {
    fn from(handler: HandlerRef) -> Self {
        RouteSpec::Bare(handler)
    }
}

/// Ordered `key => routes` declarations, as passed to `Emitter::build`.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<(String, RouteSpec)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. `key` is an event type name, `all` or `*`.
    pub fn on(mut self, key: impl Into<String>, spec: impl Into<RouteSpec>) -> Self {
        self.entries.push((key.into(), spec.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Trigger {
    pattern: String,
    handler: Rc<dyn EventHandler>,
}

/// The listener produced from a route table.
///
/// Triggers are grouped per key in the order keys first appeared, and each
/// group keeps its routes in declaration order. An event runs every trigger
/// under its own type and under the wildcard, in that stored order.
pub struct RouteListener {
    triggers: Vec<(TriggerKey, Vec<Trigger>)>,
}

impl RouteListener {
    /// Normalizes `routes` and resolves every handler reference.
    ///
    /// Entries under unknown keys are ignored.
    pub fn build(routes: RouteTable, registry: &HandlerRegistry) -> Result<Self, EventError> {
        let mut triggers: Vec<(TriggerKey, Vec<Trigger>)> = Vec::new();

        for (name, spec) in routes.entries {
            let Some(key) = TriggerKey::parse(&name) else {
                debug!("Ignoring route entry with unknown key '{}'", name);
                continue;
            };

            let mut resolved = Vec::new();
            for route in spec.into_routes() {
                resolved.push(Trigger {
                    pattern: route.pattern,
                    handler: registry.resolve(route.handler)?,
                });
            }

            match triggers.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, list)) => list.extend(resolved),
                None => triggers.push((key, resolved)),
            }
        }

        Ok(Self { triggers })
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.iter().map(|(_, list)| list.len()).sum()
    }
}

impl Listener for RouteListener {
    fn handles(&self, _kind: EventKind) -> bool {
        true
    }

    fn handle(&self, event: &Event) -> Result<(), EventError> {
        let mut failures = 0usize;

        for (key, list) in &self.triggers {
            if !key.applies_to(event.kind()) {
                continue;
            }
            for trigger in list {
                if !event.matches(&trigger.pattern) {
                    continue;
                }
                if let Err(e) = trigger.handler.handle(event) {
                    warn!(
                        "Handler '{}' failed on {} (pattern '{}'): {}",
                        trigger.handler.handler_name(),
                        event.kind(),
                        trigger.pattern,
                        e
                    );
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            return Err(EventError::HandlerExecution(format!(
                "{failures} handler(s) failed on {}",
                event.kind()
            )));
        }
        Ok(())
    }

    fn listener_name(&self) -> &str {
        "routes"
    }
}
