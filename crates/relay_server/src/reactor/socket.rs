//! One registered socket: the mio source, sticky readiness and TLS session.

use super::Negotiation;
use crate::config::READ_BUFFER_SIZE;
use mio::net::{TcpListener, TcpStream};
use rustls::{ServerConfig, ServerConnection};
use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) enum SocketIo {
    Listener(TcpListener),
    Stream(TcpStream),
}

/// Registry entry for one handle.
///
/// mio reports readiness edges; the flags below stay set until an operation
/// hits `WouldBlock` (or end of stream), which turns the edges back into
/// levels for the reactor loop.
pub(crate) struct SocketEntry {
    pub(crate) io: SocketIo,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) errored: bool,
    pub(crate) eof: bool,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) tls_config: Option<Arc<ServerConfig>>,
    tls: Option<ServerConnection>,
    tls_active: bool,
    first_flight: Vec<u8>,
}

impl SocketEntry {
    pub(crate) fn listener(listener: TcpListener, tls_config: Option<Arc<ServerConfig>>) -> Self {
        Self::new(SocketIo::Listener(listener), None, tls_config)
    }

    pub(crate) fn stream(stream: TcpStream, peer: SocketAddr, tls_config: Option<Arc<ServerConfig>>) -> Self {
        Self::new(SocketIo::Stream(stream), Some(peer), tls_config)
    }

    fn new(io: SocketIo, peer: Option<SocketAddr>, tls_config: Option<Arc<ServerConfig>>) -> Self {
        Self {
            io,
            readable: false,
            writable: false,
            errored: false,
            eof: false,
            peer,
            tls_config,
            tls: None,
            tls_active: false,
            first_flight: Vec::new(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        if self.eof || self.errored {
            return false;
        }
        match &self.io {
            SocketIo::Listener(_) => true,
            SocketIo::Stream(stream) => stream.peer_addr().is_ok() && matches!(stream.take_error(), Ok(None)),
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.io {
            SocketIo::Listener(listener) => listener.local_addr(),
            SocketIo::Stream(stream) => stream.local_addr(),
        }
    }

    /// Reads up to `max` bytes of application data.
    ///
    /// An empty result means nothing was available; `eof` tells whether the
    /// peer has finished.
    pub(crate) fn read(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let SocketIo::Stream(stream) = &mut self.io else {
            return Err(io::Error::new(ErrorKind::InvalidInput, "cannot read from a listening socket"));
        };

        if self.tls_active {
            if let Some(tls) = self.tls.as_mut() {
                return read_tls_plaintext(tls, stream, max, &mut self.readable, &mut self.writable, &mut self.eof);
            }
        }

        let mut buf = vec![0u8; max];
        match stream.read(&mut buf) {
            Ok(0) => {
                self.eof = true;
                self.readable = false;
                Ok(Vec::new())
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.readable = false;
                Ok(Vec::new())
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Writes as much of `data` as the socket (or TLS session) accepts.
    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let SocketIo::Stream(stream) = &mut self.io else {
            return Err(io::Error::new(ErrorKind::InvalidInput, "cannot write to a listening socket"));
        };

        if self.tls_active {
            if let Some(tls) = self.tls.as_mut() {
                let accepted = tls.writer().write(data)?;
                flush_tls(tls, stream, &mut self.writable)?;
                return Ok(accepted);
            }
        }

        match stream.write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.writable = false;
                Ok(0)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Pushes buffered TLS records out, if there are any.
    pub(crate) fn flush_pending_tls(&mut self) -> io::Result<()> {
        if let (Some(tls), SocketIo::Stream(stream)) = (self.tls.as_mut(), &mut self.io) {
            flush_tls(tls, stream, &mut self.writable)?;
        }
        Ok(())
    }

    /// Advances the server-side TLS handshake with whatever the socket has.
    ///
    /// Every raw byte read while handshaking is kept, so a failed negotiation
    /// can hand the plaintext back to the caller.
    pub(crate) fn negotiate(&mut self) -> Negotiation {
        if self.tls_active {
            return Negotiation::Established;
        }
        let SocketIo::Stream(stream) = &mut self.io else {
            return Negotiation::Failed { plaintext: Vec::new() };
        };

        if self.tls.is_none() {
            let Some(config) = self.tls_config.clone() else {
                warn!("TLS negotiation requested on a socket without TLS configuration");
                return Negotiation::Failed { plaintext: Vec::new() };
            };
            match ServerConnection::new(config) {
                Ok(session) => self.tls = Some(session),
                Err(e) => {
                    warn!("Failed to create TLS session: {}", e);
                    return Negotiation::Failed { plaintext: Vec::new() };
                }
            }
        }
        let Some(tls) = self.tls.as_mut() else {
            return Negotiation::Failed { plaintext: Vec::new() };
        };

        let mut chunk = vec![0u8; READ_BUFFER_SIZE];
        match stream.read(&mut chunk) {
            Ok(0) => {
                self.eof = true;
                self.readable = false;
                self.tls = None;
                return Negotiation::Failed { plaintext: mem::take(&mut self.first_flight) };
            }
            Ok(n) => chunk.truncate(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                self.readable = false;
                return Negotiation::Pending;
            }
            Err(e) => {
                debug!("Read failed during TLS negotiation: {}", e);
                self.errored = true;
                self.tls = None;
                return Negotiation::Failed { plaintext: mem::take(&mut self.first_flight) };
            }
        }
        self.first_flight.extend_from_slice(&chunk);

        let mut rest = &chunk[..];
        while !rest.is_empty() {
            let fed = tls.read_tls(&mut rest);
            let processed = fed.map_err(|e| e.to_string()).and_then(|_| {
                tls.process_new_packets().map(|_| ()).map_err(|e| e.to_string())
            });
            if let Err(reason) = processed {
                // Nothing from the failed session reaches the wire; in auto
                // mode the same socket continues as plain HTTP.
                debug!("TLS negotiation failed: {}", reason);
                self.tls = None;
                return Negotiation::Failed { plaintext: mem::take(&mut self.first_flight) };
            }
        }

        if let Err(e) = flush_tls(tls, stream, &mut self.writable) {
            debug!("Failed to send TLS handshake records: {}", e);
            self.errored = true;
            self.tls = None;
            return Negotiation::Failed { plaintext: mem::take(&mut self.first_flight) };
        }

        if tls.is_handshaking() {
            return Negotiation::Pending;
        }

        self.tls_active = true;
        self.first_flight.clear();
        Negotiation::Established
    }

    /// Sends `close_notify` on an active TLS session.
    pub(crate) fn shutdown_tls(&mut self) {
        if let (Some(tls), SocketIo::Stream(stream)) = (self.tls.as_mut(), &mut self.io) {
            tls.send_close_notify();
            if let Err(e) = flush_tls(tls, stream, &mut self.writable) {
                debug!("Failed to send TLS close_notify: {}", e);
            }
        }
    }
}

fn read_tls_plaintext(
    tls: &mut ServerConnection,
    stream: &mut TcpStream,
    max: usize,
    readable: &mut bool,
    writable: &mut bool,
    eof: &mut bool,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max];
    loop {
        match tls.reader().read(&mut buf) {
            Ok(0) => {
                *eof = true;
                *readable = false;
                return Ok(Vec::new());
            }
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                *eof = true;
                *readable = false;
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        }

        match tls.read_tls(stream) {
            Ok(0) => {
                *eof = true;
                *readable = false;
                return Ok(Vec::new());
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                *readable = false;
                return Ok(Vec::new());
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        if let Err(e) = tls.process_new_packets() {
            return Err(io::Error::new(ErrorKind::InvalidData, e));
        }
        flush_tls(tls, stream, writable)?;
    }
}

fn flush_tls(tls: &mut ServerConnection, stream: &mut TcpStream, writable: &mut bool) -> io::Result<()> {
    while tls.wants_write() {
        match tls.write_tls(stream) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                *writable = false;
                break;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
