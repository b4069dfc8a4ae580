//! TLS termination and plain-text fallback over loopback sockets.
//!
//! The fixtures hold a test CA and a `localhost` leaf certificate signed by
//! it (SAN `localhost` and `127.0.0.1`).

mod common;

use common::{upgrade_request, Client, Harness, ACCEPT, KEY, MASK};
use relay_server::protocol::{encode_masked_frame, FrameHeader};
use relay_server::{Protocol, TlsConfig};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn tls_harness(protocol: Protocol) -> Harness {
    Harness::with_config(|config| {
        config.protocol = protocol;
        config.tls = TlsConfig {
            private_key: fixture("private_key.key"),
            certificate: fixture("certificate.pem"),
            passphrase: None,
        };
    })
}

fn client_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let mut reader = BufReader::new(File::open(fixture("ca.pem")).unwrap());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Non-blocking rustls client driven alongside the server's turns.
struct TlsClient {
    stream: TcpStream,
    tls: ClientConnection,
    received: Vec<u8>,
}

impl TlsClient {
    fn connect(harness: &Harness) -> Self {
        let before = harness.server.connection_count();
        let stream = TcpStream::connect(harness.server.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();
        stream.set_nodelay(true).unwrap();
        assert!(harness.turn_until(|h| h.server.connection_count() > before));

        let name = ServerName::try_from("localhost").unwrap();
        let tls = ClientConnection::new(client_config(), name).unwrap();
        Self {
            stream,
            tls,
            received: Vec::new(),
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.tls.writer().write_all(bytes).unwrap();
    }

    fn pump(&mut self, harness: &Harness) {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("client TLS write failed: {e}"),
            }
        }

        harness.turn();

        loop {
            match self.tls.read_tls(&mut self.stream) {
                Ok(0) => break,
                Ok(_) => {
                    self.tls.process_new_packets().unwrap();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("client TLS read failed: {e}"),
            }
        }

        let mut buf = [0u8; 65536];
        loop {
            match self.tls.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("client plaintext read failed: {e}"),
            }
        }
    }

    fn pump_until(&mut self, harness: &Harness, mut done: impl FnMut(&TlsClient) -> bool) -> bool {
        for _ in 0..500 {
            self.pump(harness);
            if done(self) {
                return true;
            }
        }
        false
    }

    fn upgrade(&mut self, harness: &Harness) {
        self.write(upgrade_request(KEY).as_bytes());
        assert!(self.pump_until(harness, |c| find(&c.received, b"\r\n\r\n").is_some()));
        assert!(!self.tls.is_handshaking());

        let end = find(&self.received, b"\r\n\r\n").unwrap() + 4;
        let response = String::from_utf8_lossy(&self.received[..end]).into_owned();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{response}");
        assert!(response.contains(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n")));
        self.received.drain(..end);
    }

    fn read_frame(&mut self, harness: &Harness) -> (u8, Vec<u8>) {
        let complete = self.pump_until(harness, |c| {
            FrameHeader::parse(&c.received).is_some_and(|h| c.received.len() as u64 >= h.frame_len())
        });
        assert!(complete, "no frame arrived");
        let header = FrameHeader::parse(&self.received).unwrap();
        let frame: Vec<u8> = self.received.drain(..header.frame_len() as usize).collect();
        (frame[0], frame[header.header_len..].to_vec())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[test]
fn test_auto_serves_plain_client_without_tls_bytes() {
    let harness = tls_harness(Protocol::Auto);
    assert_eq!(harness.server.protocol(), Protocol::Auto);

    let mut client = Client::connect(&harness);
    client.write(&harness, upgrade_request(KEY).as_bytes());
    assert!(client.pump_until(&harness, |c| c.find(b"\r\n\r\n").is_some()));

    // the response must be the first byte on the wire
    assert!(
        client.received.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"),
        "{:?}",
        String::from_utf8_lossy(&client.received)
    );
    let end = client.find(b"\r\n\r\n").unwrap() + 4;
    client.received.drain(..end);

    let connection = harness.server.connections().pop().unwrap();
    assert_eq!(connection.protocol(), Protocol::Ws);

    client.send_frame(&harness, 0x81, b"plain");
    assert!(harness.turn_until(|h| h.messages() == vec![b"plain".to_vec()]));

    harness.server.broadcast("back");
    assert_eq!(client.read_frame(&harness), (0x81, b"back".to_vec()));
}

#[test]
fn test_wss_handshake_and_messages() {
    let harness = tls_harness(Protocol::Wss);
    let mut client = TlsClient::connect(&harness);
    client.upgrade(&harness);

    let frame = encode_masked_frame(0x81, b"secure hello", MASK);
    client.write(&frame);
    assert!(client.pump_until(&harness, |_| harness.messages() == vec![b"secure hello".to_vec()]));

    harness.server.broadcast("secure reply");
    assert_eq!(client.read_frame(&harness), (0x81, b"secure reply".to_vec()));
}

#[test]
fn test_auto_accepts_tls_client() {
    let harness = tls_harness(Protocol::Auto);
    let mut client = TlsClient::connect(&harness);
    client.upgrade(&harness);

    let connection = harness.server.connections().pop().unwrap();
    assert_eq!(connection.protocol(), Protocol::Auto);

    client.write(&encode_masked_frame(0x81, b"over tls", MASK));
    assert!(client.pump_until(&harness, |_| harness.messages() == vec![b"over tls".to_vec()]));
}

#[test]
fn test_wss_rejects_plain_client() {
    let harness = tls_harness(Protocol::Wss);
    let mut client = Client::connect(&harness);
    client.write(&harness, upgrade_request(KEY).as_bytes());

    assert!(harness.turn_until(|h| h.server.connection_count() == 0));
    assert!(client.find(b"HTTP/1.1 101").is_none());
}
