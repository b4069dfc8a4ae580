//! Routes installed by `relay start`.
//!
//! * `type=ping` messages are answered with `{"type":"pong"}`.
//! * Every backlog entry is broadcast to all established connections, which
//!   is how `relay send` reaches clients of a running server.
//! * Connection lifecycle is logged.

use relay_event_system::{Emitter, EventError, HandlerRef};
use relay_server::{Connection, ServerHandle};
use serde_json::json;
use tracing::{debug, info};

/// Registers the default route set on `emitter`.
pub fn register(emitter: &mut Emitter, server: ServerHandle) -> Result<(), EventError> {
    emitter.connected(
        "*",
        HandlerRef::from_fn("log-connected", |event| {
            if let Some(connection) = Connection::from_event(event) {
                info!(
                    "Client {} connected from {}",
                    connection.id(),
                    connection
                        .remote_addr()
                        .map_or_else(|| "unknown".to_string(), |addr| addr.to_string())
                );
            }
            Ok(())
        }),
    )?;

    emitter.disconnected(
        "*",
        HandlerRef::from_fn("log-disconnected", |event| {
            if let Some(id) = event.connection_id() {
                info!("Client {} disconnected", id);
            }
            Ok(())
        }),
    )?;

    emitter.when(
        "type=ping",
        HandlerRef::from_fn("pong", |event| {
            event.send(json!({ "type": "pong" }))?;
            Ok(())
        }),
    )?;

    emitter.backlog(
        "*",
        HandlerRef::from_fn("broadcast-backlog", move |event| {
            let delivered = server.broadcast(event.raw().to_vec());
            debug!("Backlog entry of {} bytes sent to {} client(s)", event.raw().len(), delivered);
            Ok(())
        }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_event_system::EventKind;
    use relay_server::{Protocol, ServerConfig, WebSocketServer};
    use tempfile::TempDir;

    fn server(dir: &TempDir) -> WebSocketServer {
        WebSocketServer::new(ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            protocol: Protocol::Ws,
            backlog_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_register_installs_routes() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let mut emitter = Emitter::new();
        register(&mut emitter, server.handle()).unwrap();

        assert_eq!(emitter.listener_count(), 4);
    }

    #[test]
    fn test_backlog_broadcast_without_clients() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let mut emitter = Emitter::new();
        register(&mut emitter, server.handle()).unwrap();

        emitter.dispatch(EventKind::Backlog, None, r#"{"type":"notice"}"#);
        assert_eq!(emitter.stats().listener_failures, 0);
    }

    #[test]
    fn test_ping_without_connection_fails_quietly() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let mut emitter = Emitter::new();
        register(&mut emitter, server.handle()).unwrap();

        emitter.dispatch(EventKind::MessageReceived, None, r#"{"type":"ping"}"#);
        emitter.dispatch(EventKind::MessageReceived, None, r#"{"type":"chat"}"#);
        assert_eq!(emitter.stats().listener_failures, 1);
        assert_eq!(emitter.stats().events_dispatched, 2);
    }
}
