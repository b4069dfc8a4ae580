//! Integration tests for routing events through the emitter
//!
//! These tests exercise the public DSL end to end: route tables, groups,
//! type guards, handler registries and replies through a connection.

use relay_event_system::{
    ClientConnection, ConnectionId, Emitter, Event, EventError, EventKind, HandlerRef, HandlerRegistry, Payload,
    Route, RouteTable,
};
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

/// Connection stand-in that records everything sent to it
struct MockConnection {
    id: ConnectionId,
    sent: RefCell<Vec<String>>,
    closed: RefCell<bool>,
}

impl MockConnection {
    fn new(id: ConnectionId) -> Rc<Self> {
        Rc::new(Self {
            id,
            sent: RefCell::new(Vec::new()),
            closed: RefCell::new(false),
        })
    }

    fn weak(self: &Rc<Self>) -> Option<Weak<dyn ClientConnection>> {
        let weak: Weak<dyn ClientConnection> = Rc::downgrade(self) as Weak<dyn ClientConnection>;
        Some(weak)
    }
}

impl ClientConnection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        "127.0.0.1:5000".parse().ok()
    }

    fn send(&self, payload: Payload) -> Result<bool, EventError> {
        let bytes = payload.into_bytes()?;
        self.sent.borrow_mut().push(String::from_utf8_lossy(&bytes).into_owned());
        Ok(true)
    }

    fn close(&self) {
        *self.closed.borrow_mut() = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn reply(name: &str, text: &'static str) -> HandlerRef {
    HandlerRef::from_fn(name, move |event| {
        event.send(text)?;
        Ok(())
    })
}

#[test]
fn test_route_table_with_guards() {
    let mut emitter = Emitter::new();
    emitter
        .build(
            RouteTable::new()
                .on(
                    "message-received",
                    vec![
                        Route::new("l1=:object", reply("object", "object")),
                        Route::new("l1=:array", reply("array", "array")),
                        Route::new("l1=!numeric", reply("not-numeric", "not numeric")),
                    ],
                )
                .on("all", reply("any", "any")),
        )
        .expect("routes should build");

    let conn = MockConnection::new(1);
    emitter.dispatch(EventKind::MessageReceived, conn.weak(), r#"{"l1":{"a":1}}"#);
    assert_eq!(*conn.sent.borrow(), vec!["object", "not numeric", "any"]);

    conn.sent.borrow_mut().clear();
    emitter.dispatch(EventKind::MessageReceived, conn.weak(), r#"{"l1":"12"}"#);
    assert_eq!(*conn.sent.borrow(), vec!["any"]);
}

#[test]
fn test_group_dsl_example() {
    let mut emitter = Emitter::new();
    emitter.group("hello=aa", |emitter| {
        emitter.when("l1=:object", reply("object", "object received")).unwrap();
    });

    let conn = MockConnection::new(7);
    emitter.dispatch(EventKind::MessageReceived, conn.weak(), r#"{"hello":"aa","l1":{}}"#);
    emitter.dispatch(EventKind::MessageReceived, conn.weak(), r#"{"hello":"bb","l1":{}}"#);
    emitter.dispatch(EventKind::MessageReceived, conn.weak(), "not json");

    assert_eq!(*conn.sent.borrow(), vec!["object received"]);
}

#[test]
fn test_ping_route_replies_with_json() {
    let mut emitter = Emitter::new();
    emitter
        .when(
            "type=ping",
            HandlerRef::from_fn("pong", |event| {
                event.send(json!({"type": "pong", "id": event.get_or("id", json!(null))}))?;
                Ok(())
            }),
        )
        .unwrap();

    let conn = MockConnection::new(3);
    emitter.dispatch(EventKind::MessageReceived, conn.weak(), r#"{"type":"ping","id":9}"#);

    let sent = conn.sent.borrow();
    assert_eq!(sent.len(), 1);
    let reply: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(reply, json!({"type": "pong", "id": 9}));
}

#[test]
fn test_registry_and_typed_handlers() {
    #[derive(Deserialize)]
    struct Chat {
        text: String,
    }

    let mut registry = HandlerRegistry::new();
    registry.register_fn("Chat@close", |event| {
        if let Some(conn) = event.connection() {
            conn.close();
        }
        Ok(())
    });

    let mut emitter = Emitter::with_registry(registry);
    emitter
        .when(
            "type=chat",
            HandlerRef::typed("Chat@echo", |chat: Chat, event: &Event| {
                event.send(chat.text)?;
                Ok(())
            }),
        )
        .unwrap();
    emitter.when("type=bye", "Chat@close").unwrap();

    let conn = MockConnection::new(11);
    emitter.dispatch(EventKind::MessageReceived, conn.weak(), r#"{"type":"chat","text":"hi"}"#);
    emitter.dispatch(EventKind::MessageReceived, conn.weak(), r#"{"type":"bye"}"#);

    assert_eq!(*conn.sent.borrow(), vec!["hi"]);
    assert!(*conn.closed.borrow());
    assert_eq!(emitter.stats().listener_failures, 0);
}

#[test]
fn test_handler_errors_do_not_stop_dispatch() {
    let mut emitter = Emitter::new();
    emitter.when("*", HandlerRef::from_fn("fails", |_| Err(EventError::HandlerExecution("bad".into())))).unwrap();
    emitter.when("*", reply("after", "still here")).unwrap();

    let conn = MockConnection::new(5);
    emitter.dispatch(EventKind::MessageReceived, conn.weak(), "{}");

    assert_eq!(*conn.sent.borrow(), vec!["still here"]);
    assert_eq!(emitter.stats().listener_failures, 1);
}

#[test]
fn test_backlog_event_has_no_connection() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();

    let mut emitter = Emitter::new();
    emitter
        .backlog("*", HandlerRef::from_fn("drain", move |event| {
            assert!(event.connection().is_none());
            assert!(matches!(event.send("x"), Err(EventError::ConnectionGone)));
            sink.borrow_mut().push(event.raw_text().into_owned());
            Ok(())
        }))
        .unwrap();

    emitter.dispatch(EventKind::Backlog, None, "queued message");
    assert_eq!(*seen.borrow(), vec!["queued message"]);
}
