//! Frame boundary detection, handshake negotiation and the frame codec.
//!
//! Everything here works on one connection's buffers and is driven by the
//! connection's read loop: [`ServerShared::packlen`] reports how many bytes
//! make up the next complete package, the connection slices them off and
//! hands them to [`ServerShared::decode`].

use super::{Encoded, ServerShared};
use crate::connection::{Connection, Status};
use crate::protocol::{
    compute_accept_key, detect, encode_frame, unmask_frame, upgrade_response, FrameHeader, HandshakeRequest,
    OpCode, BAD_REQUEST_INVALID, BAD_REQUEST_MISSING_KEY, BINARY_TYPE_BLOB, MAX_PACKAGE_SIZE,
    MAX_SEND_BUFFER_SIZE, POLICY_XML, PONG_FRAME_BYTE,
};
use crate::ServerError;
use relay_event_system::Payload;
use std::mem;
use tracing::{debug, error, trace, warn};

/// Smallest client frame: two header bytes and a mask key.
const MIN_FRAME_HEADER: usize = 6;

impl ServerShared {
    /// Length of the next complete package in the connection's inbound
    /// buffer, or 0 when more bytes are needed (or the connection was closed).
    ///
    /// Control frames are answered and consumed here. Non-final data frames
    /// are consumed into the reassembly buffer, so the returned length
    /// always belongs to the frame that completes a message.
    pub(crate) fn packlen(&self, connection: &Connection) -> usize {
        loop {
            let (status, buffered, partial_len) = {
                let state = connection.state_ref();
                (state.status, state.inbound.len(), state.frame.partial_len)
            };

            if buffered < MIN_FRAME_HEADER {
                return 0;
            }
            if status >= Status::Closing {
                return 0;
            }
            if status < Status::Established {
                return self.handshake(connection);
            }

            if partial_len > 0 {
                if buffered < partial_len {
                    return 0;
                }
                let piece: Vec<u8> = connection.state().borrow_mut().inbound.drain(..partial_len).collect();
                self.append_fragment(connection, &piece);
                connection.state().borrow_mut().frame.partial_len = 0;
                trace!("Connection {} buffered a {} byte fragment", connection.id(), partial_len);
                continue;
            }

            let Some(header) = FrameHeader::parse(&connection.state_ref().inbound) else {
                return 0;
            };

            if !header.masked {
                warn!("Connection {} sent an unmasked frame, closing", connection.id());
                self.close_on_violation(connection);
                return 0;
            }

            let assembled = connection.state_ref().frame.assembly.len() as u64;
            if assembled + header.frame_len() > MAX_PACKAGE_SIZE as u64 {
                error!(
                    "Connection {} exceeded the {} byte message limit ({} + {} bytes), closing",
                    connection.id(),
                    MAX_PACKAGE_SIZE,
                    assembled,
                    header.frame_len()
                );
                self.close_on_violation(connection);
                return 0;
            }
            // bounded by MAX_PACKAGE_SIZE above
            let frame_len = header.frame_len() as usize;

            match header.opcode {
                OpCode::Continuation | OpCode::Text | OpCode::Binary => {}
                OpCode::Close => {
                    if buffered < frame_len {
                        return 0;
                    }
                    connection.state().borrow_mut().inbound.drain(..frame_len);
                    debug!("Connection {} sent a close frame", connection.id());
                    connection.close();
                    if connection.status() >= Status::Closing {
                        return 0;
                    }
                    // a disconnecting handler kept the connection open
                    continue;
                }
                OpCode::Ping | OpCode::Pong => {
                    if buffered < frame_len {
                        return 0;
                    }
                    let frame: Vec<u8> = connection.state().borrow_mut().inbound.drain(..frame_len).collect();
                    let payload = unmask_frame(&frame);
                    if header.opcode == OpCode::Ping {
                        trace!("Ping on connection {} ({} bytes)", connection.id(), payload.len());
                        let pong = encode_frame(PONG_FRAME_BYTE, &payload);
                        if let Err(e) = connection.send(pong, true) {
                            warn!("Failed to answer ping on connection {}: {}", connection.id(), e);
                        }
                    } else {
                        connection.pong();
                    }
                    continue;
                }
                OpCode::Other(code) => {
                    warn!("Connection {} sent unsupported opcode {:#x}, closing", connection.id(), code);
                    self.close_on_violation(connection);
                    return 0;
                }
            }

            if header.fin {
                return frame_len;
            }
            connection.state().borrow_mut().frame.partial_len = frame_len;
        }
    }

    /// Handles the bytes a connection sends before the upgrade completes.
    ///
    /// Returns the length of a frame that arrived together with the request,
    /// or 0.
    pub(crate) fn handshake(&self, connection: &Connection) -> usize {
        let request = detect(&connection.state_ref().inbound);

        match request {
            HandshakeRequest::Incomplete => 0,
            HandshakeRequest::Upgrade {
                key: Some(key),
                header_len,
            } => {
                let accept = compute_accept_key(&key);
                debug!("Upgrading connection {}", connection.id());
                connection.complete_handshake(&upgrade_response(&accept), header_len);

                let upgraded = connection.status() == Status::Established;
                if upgraded && connection.inbound_len() > 0 {
                    self.packlen(connection)
                } else {
                    0
                }
            }
            HandshakeRequest::Upgrade { key: None, .. } => {
                warn!("Connection {} sent an upgrade without Sec-WebSocket-Key", connection.id());
                self.reject(connection, BAD_REQUEST_MISSING_KEY);
                0
            }
            HandshakeRequest::Policy => {
                debug!("Serving the cross-domain policy to connection {}", connection.id());
                if let Err(e) = connection.send(POLICY_XML, true) {
                    warn!("Failed to send policy to connection {}: {}", connection.id(), e);
                }
                {
                    let mut state = connection.state().borrow_mut();
                    state.inbound.clear();
                    state.packet_len = 0;
                }
                connection.ensure_writer();
                0
            }
            HandshakeRequest::Invalid => {
                warn!("Connection {} sent an invalid handshake", connection.id());
                self.reject(connection, BAD_REQUEST_INVALID);
                0
            }
        }
    }

    /// Drops everything buffered from a misbehaving client, then closes.
    ///
    /// If a `disconnecting` handler vetoes the close, the connection resumes
    /// with whatever the client sends next.
    fn close_on_violation(&self, connection: &Connection) {
        {
            let mut state = connection.state().borrow_mut();
            state.inbound.clear();
            state.packet_len = 0;
            state.frame.partial_len = 0;
            state.frame.assembly.clear();
        }
        connection.close();
    }

    fn reject(&self, connection: &Connection, response: &str) {
        if let Err(e) = connection.send(response, true) {
            debug!("Failed to send 400 to connection {}: {}", connection.id(), e);
        }
        connection.close();
    }

    /// Frames a scalar payload with the connection's outgoing opcode.
    ///
    /// Frames built before the handshake completes are staged on the
    /// connection and flushed by the handshake.
    pub(crate) fn encode(&self, connection: &Connection, payload: &Payload) -> Result<Encoded, ServerError> {
        let Some(data) = payload.as_scalar() else {
            return Err(ServerError::Encode(
                "only scalar payloads can be framed, serialize containers first".to_string(),
            ));
        };

        let mut state = connection.state().borrow_mut();
        let frame = encode_frame(state.frame.opcode_byte.unwrap_or(BINARY_TYPE_BLOB), data);
        if state.frame.handshake_done {
            return Ok(Encoded::Frame(frame));
        }

        if state.frame.pending.len() + frame.len() > MAX_SEND_BUFFER_SIZE {
            warn!(
                "Staging area of connection {} is full, dropping {} bytes",
                connection.id(),
                frame.len()
            );
            return Ok(Encoded::Overflow);
        }
        state.frame.pending.extend_from_slice(&frame);
        Ok(Encoded::Staged)
    }

    /// Unmasks a non-final frame onto the reassembly buffer.
    pub(crate) fn append_fragment(&self, connection: &Connection, frame: &[u8]) {
        let payload = unmask_frame(frame);
        connection.state().borrow_mut().frame.assembly.extend_from_slice(&payload);
    }

    /// Unmasks one client frame.
    ///
    /// While a fragmented message is being reassembled the payload is
    /// appended and the whole assembly returned; otherwise the assembly (if
    /// any) is prepended and cleared.
    pub(crate) fn decode(&self, connection: &Connection, frame: &[u8]) -> Vec<u8> {
        if connection.state_ref().frame.partial_len > 0 {
            self.append_fragment(connection, frame);
            return connection.state_ref().frame.assembly.clone();
        }

        let payload = unmask_frame(frame);
        let mut state = connection.state().borrow_mut();
        if state.frame.assembly.is_empty() {
            return payload;
        }

        let mut message = mem::take(&mut state.frame.assembly);
        message.extend_from_slice(&payload);
        message
    }
}
