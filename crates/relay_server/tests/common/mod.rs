//! Loopback harness shared by the integration tests.
//!
//! The server runs on the test thread; every helper that waits for
//! something drives `turn()` itself.

#![allow(dead_code)]

use relay_event_system::{Emitter, Event, EventError, EventKind, Listener};
use relay_server::protocol::{encode_masked_frame, FrameHeader};
use relay_server::{Protocol, ServerConfig, WebSocketServer};
use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;

pub const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
pub const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

const MAX_TURNS: usize = 500;

pub type EventLog = Rc<RefCell<Vec<(EventKind, Vec<u8>)>>>;

/// Records every event it sees.
pub struct Recorder {
    log: EventLog,
}

impl Listener for Recorder {
    fn handles(&self, _kind: EventKind) -> bool {
        true
    }

    fn handle(&self, event: &Event) -> Result<(), EventError> {
        self.log.borrow_mut().push((event.kind(), event.raw().to_vec()));
        Ok(())
    }

    fn listener_name(&self) -> &str {
        "recorder"
    }
}

pub struct Harness {
    pub server: WebSocketServer,
    pub log: EventLog,
    pub dir: TempDir,
}

impl Harness {
    /// A bound plain-`ws` server on an ephemeral loopback port.
    pub fn new() -> Self {
        Self::with_routes(|_| Ok(()))
    }

    /// Like [`Harness::new`], registering extra routes after the recorder.
    pub fn with_routes<F>(routes: F) -> Self
    where
        F: FnOnce(&mut Emitter) -> Result<(), EventError>,
    {
        Self::build(|_| {}, routes)
    }

    /// A server whose configuration `configure` adjusts before binding.
    pub fn with_config(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        Self::build(configure, |_| Ok(()))
    }

    fn build<F>(configure: impl FnOnce(&mut ServerConfig), routes: F) -> Self
    where
        F: FnOnce(&mut Emitter) -> Result<(), EventError>,
    {
        let dir = TempDir::new().unwrap();
        let mut config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            protocol: Protocol::Ws,
            poll_timeout: Duration::from_millis(1),
            backlog_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        configure(&mut config);
        let server = WebSocketServer::new(config).unwrap();

        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        let recorder = Recorder { log: log.clone() };
        server
            .routes(move |emitter, _handle| {
                emitter.push(recorder);
                routes(emitter)
            })
            .unwrap();
        server.bind().unwrap();

        Self { server, log, dir }
    }

    pub fn turn(&self) {
        self.server.turn().unwrap();
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.log.borrow().iter().filter(|(seen, _)| *seen == kind).count()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.events(EventKind::MessageReceived)
    }

    pub fn events(&self, kind: EventKind) -> Vec<Vec<u8>> {
        self.log
            .borrow()
            .iter()
            .filter(|(seen, _)| *seen == kind)
            .map(|(_, raw)| raw.clone())
            .collect()
    }

    /// Turns until `done` holds; false if it never did.
    pub fn turn_until(&self, mut done: impl FnMut(&Harness) -> bool) -> bool {
        for _ in 0..MAX_TURNS {
            self.turn();
            if done(self) {
                return true;
            }
        }
        false
    }
}

/// Blocking-free test client.
pub struct Client {
    stream: TcpStream,
    pub received: Vec<u8>,
    pub closed: bool,
}

impl Client {
    /// Connects and waits until the server has accepted the socket.
    pub fn connect(harness: &Harness) -> Self {
        let before = harness.server.connection_count();
        let stream = TcpStream::connect(harness.server.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();
        stream.set_nodelay(true).unwrap();
        assert!(harness.turn_until(|h| h.server.connection_count() > before));

        Self {
            stream,
            received: Vec::new(),
            closed: false,
        }
    }

    /// Connects and completes the opening handshake.
    pub fn upgraded(harness: &Harness) -> Self {
        let mut client = Self::connect(harness);
        client.write(harness, upgrade_request(KEY).as_bytes());
        assert!(client.pump_until(harness, |c| c.find(b"\r\n\r\n").is_some()));

        let end = client.find(b"\r\n\r\n").unwrap() + 4;
        let response = String::from_utf8_lossy(&client.received[..end]).into_owned();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{response}");
        assert!(response.contains(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n")));
        client.received.drain(..end);
        client
    }

    /// Writes everything, turning the server while the socket is full.
    ///
    /// Stops early if the server hangs up mid-write.
    pub fn write(&mut self, harness: &Harness, mut bytes: &[u8]) {
        let mut attempts = 0;
        while !bytes.is_empty() && !self.closed {
            match self.stream.write(bytes) {
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    attempts += 1;
                    assert!(attempts < MAX_TURNS * 10, "server stopped reading");
                    harness.turn();
                }
                Err(e) if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => {
                    self.closed = true;
                }
                Err(e) => panic!("client write failed: {e}"),
            }
        }
    }

    /// Sends one masked frame.
    pub fn send_frame(&mut self, harness: &Harness, first_byte: u8, payload: &[u8]) {
        let frame = encode_masked_frame(first_byte, payload, MASK);
        self.write(harness, &frame);
    }

    /// Reads whatever has arrived.
    pub fn drain(&mut self) {
        let mut buf = [0u8; 65536];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => self.received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    pub fn pump(&mut self, harness: &Harness) {
        harness.turn();
        self.drain();
    }

    pub fn pump_until(&mut self, harness: &Harness, mut done: impl FnMut(&Client) -> bool) -> bool {
        for _ in 0..MAX_TURNS {
            self.pump(harness);
            if done(self) {
                return true;
            }
        }
        false
    }

    pub fn pump_until_closed(&mut self, harness: &Harness) -> bool {
        self.pump_until(harness, |c| c.closed)
    }

    /// Removes one complete server frame from `received`.
    pub fn next_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        let header = FrameHeader::parse(&self.received)?;
        let frame_len = header.frame_len() as usize;
        if self.received.len() < frame_len {
            return None;
        }
        let first = self.received[0];
        let frame: Vec<u8> = self.received.drain(..frame_len).collect();
        Some((first, frame[header.header_len..].to_vec()))
    }

    /// Pumps until a whole frame is available and returns it.
    pub fn read_frame(&mut self, harness: &Harness) -> (u8, Vec<u8>) {
        for _ in 0..MAX_TURNS {
            if let Some(frame) = self.next_frame() {
                return frame;
            }
            self.pump(harness);
        }
        panic!("no frame arrived, buffered: {:?}", String::from_utf8_lossy(&self.received));
    }

    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        self.received.windows(needle.len()).position(|window| window == needle)
    }
}

pub fn upgrade_request(key: &str) -> String {
    format!(
        "GET /chat HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}
