//! Wire format encoding and decoding.
//!
//! Client frames:
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────┬─────────┐
//! │ FIN + opcode │ MASK + len7  │ ext len      │ mask key │ payload │
//! │ 1 byte       │ 1 byte       │ 0 or 2 bytes │ 4 bytes  │ len     │
//! └──────────────┴──────────────┴──────────────┴──────────┴─────────┘
//! ```
//!
//! Server frames carry no mask key. Extended lengths are Big Endian. The
//! 64-bit extended length (len7 == 127) is not supported in either direction.

use crate::error::{Result, WsError};

/// Length code announcing a 16-bit extended length.
pub const LEN_16: u8 = 126;

/// Length code announcing a 64-bit extended length (unsupported).
pub const LEN_64: u8 = 127;

/// Largest payload expressible in the 7-bit length field.
pub const MAX_SHORT_PAYLOAD: usize = 125;

/// Largest payload a frame may carry here.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Largest control frame payload (RFC 6455 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest server frame header (token + 126 + 2 length bytes).
pub const MAX_SERVER_HEADER: usize = 4;

/// Client header size without extended length.
pub const CLIENT_HEADER_SHORT: usize = 6;

/// Client header size with a 16-bit extended length.
pub const CLIENT_HEADER_EXTENDED: usize = 8;

/// Header bits.
pub mod bits {
    /// Final fragment flag in byte 0.
    pub const FIN: u8 = 0b1000_0000;
    /// Reserved bits in byte 0 (ignored).
    pub const RSV_MASK: u8 = 0b0111_0000;
    /// Opcode bits in byte 0.
    pub const OPCODE_MASK: u8 = 0b0000_1111;
    /// Mask flag in byte 1.
    pub const MASKED: u8 = 0b1000_0000;
    /// Length code bits in byte 1.
    pub const LEN_MASK: u8 = 0b0111_1111;
}

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text data.
    Text = 0x1,
    /// Binary data.
    Binary = 0x2,
    /// Close handshake.
    Close = 0x8,
    /// Keepalive request.
    Ping = 0x9,
    /// Keepalive answer.
    Pong = 0xA,
}

impl Opcode {
    /// Parse the low nibble of byte 0. Reserved opcodes yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & bits::OPCODE_MASK {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Close, Ping or Pong.
    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// First header byte: FIN flag, reserved bits and opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStart(pub u8);

impl FrameStart {
    /// Final text frame.
    pub const TEXT: Self = Self::final_frame(Opcode::Text);
    /// Final binary frame.
    pub const BINARY: Self = Self::final_frame(Opcode::Binary);
    /// Ping.
    pub const PING: Self = Self::final_frame(Opcode::Ping);
    /// Pong.
    pub const PONG: Self = Self::final_frame(Opcode::Pong);
    /// Close.
    pub const CLOSE: Self = Self::final_frame(Opcode::Close);

    /// Token for an unfragmented frame.
    pub const fn final_frame(opcode: Opcode) -> Self {
        Self(bits::FIN | opcode as u8)
    }

    /// Token for text or binary data.
    #[inline]
    pub fn data(is_binary: bool) -> Self {
        if is_binary {
            Self::BINARY
        } else {
            Self::TEXT
        }
    }

    /// Raw token byte.
    #[inline]
    pub fn token(self) -> u8 {
        self.0
    }

    /// FIN flag.
    #[inline]
    pub fn fin(self) -> bool {
        self.0 & bits::FIN != 0
    }

    /// Raw opcode nibble.
    #[inline]
    pub fn opcode_bits(self) -> u8 {
        self.0 & bits::OPCODE_MASK
    }

    /// Parsed opcode, `None` for reserved values.
    #[inline]
    pub fn opcode(self) -> Option<Opcode> {
        Opcode::from_u8(self.0)
    }
}

/// Decoded server frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHeader {
    /// First header byte.
    pub start: FrameStart,
    /// Payload length.
    pub payload_len: usize,
    /// Encoded header size (2 or 4).
    pub header_len: usize,
}

impl ServerHeader {
    /// Create a header, checking that the length is encodable.
    pub fn new(start: FrameStart, payload_len: usize) -> Result<Self> {
        Ok(Self {
            start,
            payload_len,
            header_len: header_len(payload_len)?,
        })
    }

    /// Encode into a fixed buffer, returning the used prefix length.
    pub fn encode_into(&self, buf: &mut [u8; MAX_SERVER_HEADER]) -> usize {
        buf[0] = self.start.token();
        if self.payload_len <= MAX_SHORT_PAYLOAD {
            buf[1] = self.payload_len as u8;
            2
        } else {
            buf[1] = LEN_16;
            buf[2..4].copy_from_slice(&(self.payload_len as u16).to_be_bytes());
            4
        }
    }

    /// Encode to an owned array plus its length.
    pub fn encode(&self) -> ([u8; MAX_SERVER_HEADER], usize) {
        let mut buf = [0u8; MAX_SERVER_HEADER];
        let len = self.encode_into(&mut buf);
        (buf, len)
    }

    /// Decode an unmasked server header.
    ///
    /// Returns `None` if the buffer is too short, the mask bit is set, or the
    /// 64-bit length code is used.
    ///
    /// # Example
    ///
    /// ```
    /// use websocketd::protocol::{FrameStart, ServerHeader};
    ///
    /// let header = ServerHeader::decode(&[0x81, 0x7E, 0x01, 0x00]).unwrap();
    /// assert_eq!(header.start, FrameStart::TEXT);
    /// assert_eq!(header.payload_len, 256);
    /// assert_eq!(header.header_len, 4);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 2 || buf[1] & bits::MASKED != 0 {
            return None;
        }
        let start = FrameStart(buf[0]);
        match buf[1] & bits::LEN_MASK {
            LEN_64 => None,
            LEN_16 => {
                if buf.len() < 4 {
                    return None;
                }
                Some(Self {
                    start,
                    payload_len: u16::from_be_bytes([buf[2], buf[3]]) as usize,
                    header_len: 4,
                })
            }
            len => Some(Self {
                start,
                payload_len: len as usize,
                header_len: 2,
            }),
        }
    }
}

/// Server header size for a payload length.
pub fn header_len(payload_len: usize) -> Result<usize> {
    if payload_len <= MAX_SHORT_PAYLOAD {
        Ok(2)
    } else if payload_len <= MAX_PAYLOAD {
        Ok(4)
    } else {
        Err(WsError::FrameTooLarge(payload_len))
    }
}

/// XOR `data` with the cycled mask key.
///
/// `offset` is the number of payload bytes of the same frame already
/// processed, so a payload split across buffers unmasks identically.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) % 4];
    }
}
