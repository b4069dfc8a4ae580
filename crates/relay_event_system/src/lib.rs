//! # Relay Event System
//!
//! Pattern-routed event dispatch for the Relay WebSocket engine.
//!
//! The server turns socket activity into [`Event`]s (a connection opened, a
//! message arrived, a backlog entry was drained) and hands each one to the
//! [`Emitter`]. The emitter walks its [`Listener`]s in registration order and
//! every listener runs the handlers whose pattern matches the event's data.
//!
//! ## Routing DSL
//!
//! ```rust
//! use relay_event_system::{Emitter, HandlerRef};
//!
//! let mut emitter = Emitter::new();
//!
//! emitter.group("hello=aa", |emitter| {
//!     emitter
//!         .when("l1=:object", HandlerRef::from_fn("object", |event| {
//!             event.send("object received")?;
//!             Ok(())
//!         }))
//!         .ok();
//! });
//!
//! emitter.connected("*", HandlerRef::from_fn("welcome", |event| {
//!     event.send("welcome")?;
//!     Ok(())
//! })).ok();
//! ```
//!
//! ## Patterns
//!
//! Patterns are `&&`-joined clauses evaluated by [`DataResolver::matches`]:
//! bare paths test existence, `path=value` compares loosely, and
//! `path=:type` / `path=!type` check the JSON type of the resolved value.
//!
//! ## Threading
//!
//! Dispatch is single-threaded. Handlers run to completion inside the
//! server's reactor turn, so they may freely call back into the connection
//! that raised the event.

pub mod emitter;
pub mod event;
pub mod handlers;
pub mod listener;
pub mod payload;
pub mod resolver;

pub use emitter::{Emitter, EmitterStats};
pub use event::{ClientConnection, ConnectionId, Event, EventKind};
pub use handlers::{EventHandler, FnEventHandler, HandlerRef, HandlerRegistry, TypedEventHandler};
pub use listener::{Listener, Route, RouteListener, RouteSpec, RouteTable, TriggerKey};
pub use payload::Payload;
pub use resolver::{DataResolver, TypeGuard};

/// Errors raised while registering or running event handlers.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Serialization failed when turning a value into a payload
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Event data did not fit the type a typed handler expects
    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),
    /// A named handler reference was not present in the registry
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),
    /// A handler reported a failure
    #[error("Handler execution error: {0}")]
    HandlerExecution(String),
    /// An event type name outside the known vocabulary
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    /// The connection behind an event no longer exists
    #[error("Connection no longer exists")]
    ConnectionGone,
}
