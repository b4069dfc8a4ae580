//! Opening handshake detection and responses.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Reply sent when an HTTP request carries no `Sec-WebSocket-Key`.
pub const BAD_REQUEST_MISSING_KEY: &str = "HTTP/1.1 400 Bad Request\r\n\r\n\
<b>400 Bad Request</b><br>Sec-WebSocket-Key not found.<br>\
This is a WebSocket service and can not be accessed via HTTP.";

/// Reply sent for anything that is neither an upgrade nor a policy request.
pub const BAD_REQUEST_INVALID: &str = "HTTP/1.1 400 Bad Request\r\n\r\n\
<b>400 Bad Request</b><br>Invalid handshake data for websocket.";

/// Flash cross-domain policy document, NUL-terminated.
pub const POLICY_XML: &[u8] = b"<?xml version=\"1.0\"?><cross-domain-policy>\
<site-control permitted-cross-domain-policies=\"all\"/>\
<allow-access-from domain=\"*\" to-ports=\"*\"/></cross-domain-policy>\0";

/// What the bytes buffered before the handshake turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRequest {
    /// A `GET` whose headers are not complete yet.
    Incomplete,
    /// A complete `GET` request. `header_len` covers the terminating blank line.
    Upgrade { key: Option<String>, header_len: usize },
    /// A legacy `<policy-file-request/>`.
    Policy,
    Invalid,
}

/// Classifies the start of a connection's inbound buffer.
pub fn detect(buf: &[u8]) -> HandshakeRequest {
    if buf.starts_with(b"GET") {
        let Some(end) = find(buf, b"\r\n\r\n") else {
            return HandshakeRequest::Incomplete;
        };
        let header_len = end + 4;
        return HandshakeRequest::Upgrade {
            key: find_websocket_key(&buf[..header_len]),
            header_len,
        };
    }

    if buf.starts_with(b"<polic") {
        return HandshakeRequest::Policy;
    }

    HandshakeRequest::Invalid
}

/// Finds a `Sec-WebSocket-Key` header (name matched case-insensitively).
pub fn find_websocket_key(buf: &[u8]) -> Option<String> {
    const NAME: &[u8] = b"sec-websocket-key:";

    buf.split(|&byte| byte == b'\n')
        .filter_map(|line| line.strip_suffix(b"\r"))
        .find(|line| line.len() >= NAME.len() && line[..NAME.len()].eq_ignore_ascii_case(NAME))
        .map(|line| String::from_utf8_lossy(&line[NAME.len()..]).trim().to_string())
}

/// `base64(sha1(key + GUID))`.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// The `101 Switching Protocols` response for an accept value.
pub fn upgrade_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Connection: Upgrade\r\n\
         Server: relay/{}\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        env!("CARGO_PKG_VERSION"),
        accept
    )
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
