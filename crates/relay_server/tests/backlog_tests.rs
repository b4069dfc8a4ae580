//! Integration tests for the backlog mailbox
//!
//! A second `Backlog` built from the same configuration plays the role of
//! the `relay send` process.

mod common;

use common::{Client, Harness};
use relay_event_system::{EventKind, HandlerRef};
use relay_server::Backlog;

#[test]
fn test_put_backlog_dispatches_on_next_turn() {
    let harness = Harness::new();

    let path = harness.server.put_backlog("hi").unwrap();
    assert!(path.exists());

    harness.turn();
    assert_eq!(harness.events(EventKind::Backlog), vec![b"hi".to_vec()]);
    assert!(!path.exists());

    for _ in 0..5 {
        harness.turn();
    }
    assert_eq!(harness.count(EventKind::Backlog), 1);
}

#[test]
fn test_external_producer_reaches_server() {
    let harness = Harness::new();
    let producer = Backlog::for_config(harness.server.config());
    assert_eq!(&producer, harness.server.backlog());

    producer.put(br#"{"type":"notice"}"#).unwrap();
    producer.put(b"second").unwrap();

    assert_eq!(harness.server.check_backlog().unwrap(), 2);
    assert_eq!(
        harness.events(EventKind::Backlog),
        vec![br#"{"type":"notice"}"#.to_vec(), b"second".to_vec()]
    );
    assert_eq!(harness.server.check_backlog().unwrap(), 0);
}

#[test]
fn test_backlog_route_broadcasts() {
    let harness = Harness::new();
    let handle = harness.server.handle();
    harness
        .server
        .routes(move |emitter, _| {
            emitter.backlog(
                "type=notice",
                HandlerRef::from_fn("relay", move |event| {
                    handle.broadcast(event.raw().to_vec());
                    Ok(())
                }),
            )?;
            Ok(())
        })
        .unwrap();

    let mut client = Client::upgraded(&harness);
    harness.server.put_backlog(r#"{"type":"notice","text":"maintenance"}"#).unwrap();
    harness.server.put_backlog(r#"{"type":"ignored"}"#).unwrap();

    let (_, payload) = client.read_frame(&harness);
    assert_eq!(payload, br#"{"type":"notice","text":"maintenance"}"#);
    assert_eq!(harness.count(EventKind::Backlog), 2);
}

#[test]
fn test_clear_backlog() {
    let harness = Harness::new();
    harness.server.put_backlog("stale").unwrap();
    harness.server.clear_backlog().unwrap();

    harness.turn();
    assert_eq!(harness.count(EventKind::Backlog), 0);
    assert!(!harness.server.backlog().log_path().exists());
}
