//! # Relay Server
//!
//! A single-threaded WebSocket server engine built on a readiness reactor.
//!
//! ## Architecture
//!
//! * [`Reactor`] owns every socket and callback registration and runs the
//!   poll loop: ticks first, then read, write and except callbacks in socket
//!   order.
//! * [`Connection`] is the per-socket state machine: TLS negotiation (with
//!   plain-text fallback in `auto` mode), inbound buffering, outbound
//!   queueing with a hard cap, and lifecycle events.
//! * [`WebSocketServer`] accepts sockets, negotiates the RFC 6455 handshake,
//!   finds frame boundaries, reassembles fragmented messages, answers pings
//!   and drains the [`Backlog`] mailbox on every tick.
//!
//! Events are routed through a [`relay_event_system::Emitter`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_event_system::HandlerRef;
//! use relay_server::{Protocol, ServerConfig, WebSocketServer};
//!
//! # fn main() -> Result<(), relay_server::ServerError> {
//! let server = WebSocketServer::new(ServerConfig {
//!     port: 9000,
//!     protocol: Protocol::Ws,
//!     ..ServerConfig::default()
//! })?;
//!
//! server.routes(|emitter, _server| {
//!     emitter.when("type=ping", HandlerRef::from_fn("pong", |event| {
//!         event.send(r#"{"type":"pong"}"#)?;
//!         Ok(())
//!     }))?;
//!     Ok(())
//! })?;
//!
//! server.start()
//! # }
//! ```

pub mod backlog;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod tls;

pub use backlog::Backlog;
pub use config::{Protocol, ServerConfig, TlsConfig, DEFAULT_LISTEN_BACKLOG, READ_BUFFER_SIZE};
pub use connection::{Connection, SendStatus, Status};
pub use error::ServerError;
pub use reactor::{Callback, EventId, EventType, HandleId, Negotiation, Reactor};
pub use server::{Encoded, ServerHandle, ServerStatus, WebSocketServer};
