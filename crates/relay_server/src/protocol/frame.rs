//! RFC 6455 frame header parsing, encoding and unmasking.

/// Upper bound of a connection's outbound buffer, and of the output staged
/// before the handshake completes.
pub const MAX_SEND_BUFFER_SIZE: usize = 1_048_576;

/// Upper bound of one logical message, headers and continuation frames included.
pub const MAX_PACKAGE_SIZE: usize = 10_485_760;

/// Default first byte of outgoing frames: `FIN` plus opcode 0x1.
///
/// The `blob` binary type sends text frames; the name is kept from that
/// setting.
pub const BINARY_TYPE_BLOB: u8 = 0x81;

/// First byte of a pong reply.
pub const PONG_FRAME_BYTE: u8 = 0x8A;

/// WebSocket operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Any reserved value.
    Other(u8),
}

impl OpCode {
    /// Check if this is a control frame.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Check if this is a data frame.
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::Continuation)
    }
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Other(other),
        }
    }
}

/// The fixed part of a frame plus its decoded length fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: OpCode,
    pub masked: bool,
    /// Base header, extended length and mask key.
    pub header_len: usize,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Parses the header at the start of `buf`.
    ///
    /// Returns `None` while the length fields are not fully buffered. The
    /// 64-bit form is read as two big-endian 32-bit words.
    pub fn parse(buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < 2 {
            return None;
        }

        let first = buf[0];
        let second = buf[1];
        let masked = second & 0x80 != 0;
        let mask_len = if masked { 4 } else { 0 };

        let (length_len, payload_len) = match second & 0x7F {
            126 => {
                let bytes = buf.get(2..4)?;
                (2, u64::from(u16::from_be_bytes([bytes[0], bytes[1]])))
            }
            127 => {
                let bytes = buf.get(2..10)?;
                let high = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let low = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                (8, u64::from(high) * 4_294_967_296 + u64::from(low))
            }
            short => (0, u64::from(short)),
        };

        Some(FrameHeader {
            fin: first & 0x80 != 0,
            opcode: OpCode::from(first & 0x0F),
            masked,
            header_len: 2 + length_len + mask_len,
            payload_len,
        })
    }

    /// Header plus payload.
    pub fn frame_len(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }
}

/// Builds an unmasked server frame.
///
/// Payloads above 65535 bytes use the 64-bit length form written as four
/// zero bytes and a 32-bit length.
pub fn encode_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 10);
    frame.push(first_byte);

    if len <= 125 {
        frame.push(len as u8);
    } else if len <= 65535 {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(&(len as u32).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}

/// Builds a masked frame the way a client would send it.
pub fn encode_masked_frame(first_byte: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 14);
    frame.push(first_byte);

    if len <= 125 {
        frame.push(0x80 | len as u8);
    } else if len <= 65535 {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, byte)| byte ^ mask[i % 4]));
    frame
}

/// Returns the payload of one complete frame, unmasked.
///
/// The mask key sits right before the payload (offset 2, 4 or 10 depending
/// on the length form). Unmasked frames are returned as-is.
pub fn unmask_frame(frame: &[u8]) -> Vec<u8> {
    let Some(header) = FrameHeader::parse(frame) else {
        return Vec::new();
    };
    let payload = frame.get(header.header_len..).unwrap_or_default();

    if !header.masked {
        return payload.to_vec();
    }

    let mask_start = header.header_len - 4;
    let mask = &frame[mask_start..header.header_len];
    payload
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ mask[i % 4])
        .collect()
}
