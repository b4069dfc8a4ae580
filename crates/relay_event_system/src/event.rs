//! The event value passed to every handler.

use crate::{DataResolver, EventError, Payload};
use serde_json::Value;
use std::any::Any;
use std::borrow::Cow;
use std::cell::Cell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::str::FromStr;

/// Identifier the server assigns to each accepted connection.
pub type ConnectionId = u64;

/// The lifecycle and message events a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connecting,
    Connected,
    HandshakeSending,
    HandshakeSended,
    MessageSending,
    MessageSended,
    MessageReceived,
    Disconnecting,
    Disconnected,
    Backlog,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::Connecting,
        EventKind::Connected,
        EventKind::HandshakeSending,
        EventKind::HandshakeSended,
        EventKind::MessageSending,
        EventKind::MessageSended,
        EventKind::MessageReceived,
        EventKind::Disconnecting,
        EventKind::Disconnected,
        EventKind::Backlog,
    ];

    /// The name used in route tables.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connecting => "connecting",
            EventKind::Connected => "connected",
            EventKind::HandshakeSending => "handshake-sending",
            EventKind::HandshakeSended => "handshake-sended",
            EventKind::MessageSending => "message-sending",
            EventKind::MessageSended => "message-sended",
            EventKind::MessageReceived => "message-received",
            EventKind::Disconnecting => "disconnecting",
            EventKind::Disconnected => "disconnected",
            EventKind::Backlog => "backlog",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| EventError::UnknownEventType(name.to_string()))
    }
}

/// The view of a live connection that handlers get through an [`Event`].
///
/// The server implements this for its connection type; handlers that need
/// more than these operations can downcast through [`ClientConnection::as_any`].
pub trait ClientConnection {
    /// Server-assigned connection id.
    fn id(&self) -> ConnectionId;

    /// Peer address, when the socket reported one.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Frames and sends `payload`. Returns `Ok(true)` when the bytes reached
    /// the socket immediately and `Ok(false)` when they were queued, staged
    /// or refused.
    fn send(&self, payload: Payload) -> Result<bool, EventError>;

    /// Starts an orderly close.
    fn close(&self);

    fn as_any(&self) -> &dyn Any;
}

/// One dispatched occurrence: its kind, the raw message, the parsed data and
/// a weak reference to the connection it concerns.
///
/// Events are created per dispatch and dropped once every listener has seen
/// them. Holding an event never keeps a connection alive.
pub struct Event {
    kind: EventKind,
    connection: Option<Weak<dyn ClientConnection>>,
    raw: Vec<u8>,
    data: Value,
    stopped: Cell<bool>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        connection: Option<Weak<dyn ClientConnection>>,
        raw: impl Into<Vec<u8>>,
    ) -> Self {
        let raw = raw.into();
        let data = DataResolver::parse(&raw);
        Self {
            kind,
            connection,
            raw,
            data,
            stopped: Cell::new(false),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The connection this event concerns, if it still exists.
    pub fn connection(&self) -> Option<Rc<dyn ClientConnection>> {
        self.connection.as_ref().and_then(Weak::upgrade)
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection().map(|conn| conn.id())
    }

    /// Parsed message, or an empty object when the message was not JSON.
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn raw_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        DataResolver::get(&self.data, path)
    }

    pub fn get_or(&self, path: &str, default: Value) -> Value {
        DataResolver::get_or(&self.data, path, default)
    }

    pub fn has(&self, path: &str) -> bool {
        DataResolver::has(&self.data, path)
    }

    /// Evaluates a route pattern against the parsed data.
    pub fn matches(&self, pattern: &str) -> bool {
        DataResolver::matches(&self.data, pattern)
    }

    /// Marks the event as stopped. Call sites that offer a veto (for example
    /// `connecting` and `disconnecting`) consult this after dispatch.
    pub fn stop_propagation(&self) {
        self.stopped.set(true);
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.stopped.get()
    }

    /// Replies on the event's connection.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<bool, EventError> {
        let connection = self.connection().ok_or(EventError::ConnectionGone)?;
        connection.send(payload.into())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("connection", &self.connection_id())
            .field("raw_len", &self.raw.len())
            .field("stopped", &self.stopped.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    struct RecordingConnection {
        sent: RefCell<Vec<Vec<u8>>>,
    }

    impl ClientConnection for RecordingConnection {
        fn id(&self) -> ConnectionId {
            42
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn send(&self, payload: Payload) -> Result<bool, EventError> {
            self.sent.borrow_mut().push(payload.into_bytes()?);
            Ok(true)
        }

        fn close(&self) {}

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("message".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_parses_message() {
        let event = Event::new(EventKind::MessageReceived, None, r#"{"a":{"b":1}}"#);
        assert_eq!(event.get("a.b"), Some(&json!(1)));
        assert!(event.matches("a.b=1"));
        assert!(event.has("a"));
        assert_eq!(event.raw_text(), r#"{"a":{"b":1}}"#);
    }

    #[test]
    fn test_non_json_message_has_empty_data() {
        let event = Event::new(EventKind::MessageReceived, None, "hello");
        assert_eq!(event.data(), &json!({}));
        assert_eq!(event.raw(), b"hello");
    }

    #[test]
    fn test_propagation_flag() {
        let event = Event::new(EventKind::Connecting, None, "[]");
        assert!(!event.is_propagation_stopped());
        event.stop_propagation();
        assert!(event.is_propagation_stopped());
    }

    #[test]
    fn test_send_goes_through_connection() {
        let conn = Rc::new(RecordingConnection {
            sent: RefCell::new(Vec::new()),
        });
        let weak: Weak<dyn ClientConnection> = Rc::downgrade(&conn) as Weak<dyn ClientConnection>;
        let event = Event::new(EventKind::MessageReceived, Some(weak), "{}");

        assert_eq!(event.connection_id(), Some(42));
        assert!(event.send(json!({"ok": true})).unwrap());
        assert_eq!(conn.sent.borrow()[0], br#"{"ok":true}"#.to_vec());
    }

    #[test]
    fn test_send_after_connection_dropped() {
        let conn: Rc<dyn ClientConnection> = Rc::new(RecordingConnection {
            sent: RefCell::new(Vec::new()),
        });
        let event = Event::new(EventKind::MessageReceived, Some(Rc::downgrade(&conn)), "{}");
        drop(conn);

        assert!(event.connection().is_none());
        assert!(matches!(event.send("late"), Err(EventError::ConnectionGone)));
    }
}
