//! WebSocket wire format: opening handshake and frames.

pub mod frame;
pub mod handshake;

pub use frame::{
    encode_frame, encode_masked_frame, unmask_frame, FrameHeader, OpCode, BINARY_TYPE_BLOB, MAX_PACKAGE_SIZE,
    MAX_SEND_BUFFER_SIZE, PONG_FRAME_BYTE,
};
pub use handshake::{
    compute_accept_key, detect, find_websocket_key, upgrade_response, HandshakeRequest, BAD_REQUEST_INVALID,
    BAD_REQUEST_MISSING_KEY, POLICY_XML,
};
