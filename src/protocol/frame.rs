//! Outgoing server frames.
//!
//! # Example
//!
//! ```
//! use websocketd::protocol::{build_frame, Frame, FrameStart};
//!
//! let bytes = build_frame(FrameStart::TEXT, b"hello").unwrap();
//! assert_eq!(&bytes[..2], &[0x81, 5]);
//!
//! let frame = Frame::parse(&bytes).unwrap();
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{FrameStart, Opcode, ServerHeader};
use crate::error::Result;

/// Close status codes used by the server.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Message too big.
    pub const TOO_BIG: u16 = 1009;
    /// Unexpected condition (allocation failure).
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Payload of keepalive pings.
pub const PING_PAYLOAD: &[u8] = b"Hi";

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: ServerHeader,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Parse one complete server frame from the start of `buf`.
    ///
    /// Returns `None` if the header is invalid or the payload is incomplete.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let header = ServerHeader::decode(buf)?;
        let end = header.header_len + header.payload_len;
        if buf.len() < end {
            return None;
        }
        Some(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[header.header_len..end]),
        })
    }

    /// Total encoded size.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        self.header.header_len + self.header.payload_len
    }

    /// Payload slice.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Parsed opcode.
    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        self.header.start.opcode()
    }

    /// Close status code, if this is a Close frame carrying one.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode() != Some(Opcode::Close) || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// Encode a complete unmasked frame.
///
/// # Errors
///
/// [`WsError::FrameTooLarge`](crate::WsError::FrameTooLarge) for payloads over 65535 bytes.
pub fn build_frame(start: FrameStart, payload: &[u8]) -> Result<Bytes> {
    let header = ServerHeader::new(start, payload.len())?;
    let (head, head_len) = header.encode();

    let mut buf = BytesMut::with_capacity(head_len + payload.len());
    buf.put_slice(&head[..head_len]);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Keepalive ping: `89 02 'H' 'i'`.
pub fn ping_frame() -> Bytes {
    Bytes::from_static(&[0x89, 0x02, b'H', b'i'])
}

/// Close frame carrying only a status code.
pub fn close_frame(status: u16) -> Bytes {
    let code = status.to_be_bytes();
    Bytes::copy_from_slice(&[FrameStart::CLOSE.token(), 2, code[0], code[1]])
}
