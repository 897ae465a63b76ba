//! Incremental decoder for client frames.
//!
//! The decoder never buffers data frames: unmasked payload is handed to a
//! [`PayloadSink`] as it arrives, and the sink decides how much it can take.
//! When it takes less than offered, parsing stalls and the caller retries the
//! unconsumed tail later. The mask position (`rx_index`) survives stalls and
//! chunk boundaries, so a frame can be spread over any number of calls.
//!
//! Control frames are reassembled in full before they are reported.
//!
//! # Example
//!
//! ```
//! use websocketd::protocol::{FrameDecoder, MessageKind, PayloadSink};
//!
//! struct Collect(Vec<u8>);
//!
//! impl PayloadSink for Collect {
//!     fn payload(&mut self, _kind: MessageKind, data: &[u8]) -> usize {
//!         self.0.extend_from_slice(data);
//!         data.len()
//!     }
//! }
//!
//! // "Hi" masked with key 00 00 00 00
//! let frame = [0x81, 0x82, 0, 0, 0, 0, b'H', b'i'];
//! let mut decoder = FrameDecoder::new();
//! let mut sink = Collect(Vec::new());
//!
//! let parsed = decoder.parse(&frame[..5], &mut sink).unwrap();
//! assert_eq!(parsed.consumed, 5);
//! let parsed = decoder.parse(&frame[5..], &mut sink).unwrap();
//! assert_eq!(parsed.consumed, 3);
//! assert_eq!(sink.0, b"Hi");
//! ```

use bytes::Bytes;

use super::wire_format::{
    apply_mask, bits, Opcode, CLIENT_HEADER_EXTENDED, CLIENT_HEADER_SHORT, LEN_16, LEN_64,
    MAX_CONTROL_PAYLOAD,
};
use crate::error::{Result, WsError};

/// Unmasking happens through a stack buffer of this size.
const SCRATCH_SIZE: usize = 128;

/// Kind of a data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// UTF-8 text (not validated).
    Text,
    /// Binary.
    Binary,
}

impl MessageKind {
    /// `true` for binary messages.
    #[inline]
    pub fn is_binary(self) -> bool {
        self == Self::Binary
    }
}

/// A fully received control frame with its unmasked payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Close request; payload is the optional status code and reason.
    Close(Bytes),
    /// Ping to be answered with a Pong carrying the same payload.
    Ping(Bytes),
    /// Answer to one of our pings.
    Pong(Bytes),
}

/// Receiver of unmasked data payload.
pub trait PayloadSink {
    /// Offer payload bytes; returns how many were taken (at most `data.len()`).
    fn payload(&mut self, kind: MessageKind, data: &[u8]) -> usize;

    /// The final frame of a message has been fully consumed.
    fn message_end(&mut self, _kind: MessageKind) {}
}

/// Result of one [`FrameDecoder::parse`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Parsed {
    /// Input bytes consumed.
    pub consumed: usize,
    /// The sink refused payload; retry the tail later.
    pub stalled: bool,
    /// A control frame completed. Parsing stops right after it.
    pub control: Option<ControlFrame>,
}

/// What the payload of the current frame is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Data(MessageKind),
    Control(Opcode),
    Discard,
}

/// Per-frame parse state. Reset when a frame is fully consumed.
#[derive(Debug)]
struct FrameHeader {
    idx: usize,
    data: [u8; CLIENT_HEADER_EXTENDED],
    need: usize,
    complete: bool,
    fin: bool,
    target: Target,
    payload_len: usize,
    payload_rem: usize,
    mask: [u8; 4],
    rx_index: usize,
    reassembly: Option<Vec<u8>>,
}

impl FrameHeader {
    fn new() -> Self {
        Self {
            idx: 0,
            data: [0; CLIENT_HEADER_EXTENDED],
            need: 2,
            complete: false,
            fin: false,
            target: Target::Discard,
            payload_len: 0,
            payload_rem: 0,
            mask: [0; 4],
            rx_index: 0,
            reassembly: None,
        }
    }
}

/// Incremental client frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    header: FrameHeader,
    fragment_opcode: Option<Opcode>,
}

impl FrameDecoder {
    /// Create a decoder positioned at a frame boundary.
    pub fn new() -> Self {
        Self {
            header: FrameHeader::new(),
            fragment_opcode: None,
        }
    }

    /// Forget the current frame and any fragmented message.
    pub fn reset(&mut self) {
        self.header = FrameHeader::new();
        self.fragment_opcode = None;
    }

    /// `true` between frames (no header bytes buffered).
    #[inline]
    pub fn at_frame_boundary(&self) -> bool {
        self.header.idx == 0
    }

    /// Opcode of the fragmented message in progress, if any.
    #[inline]
    pub fn fragment_opcode(&self) -> Option<Opcode> {
        self.fragment_opcode
    }

    /// Payload bytes of the current frame still expected.
    #[inline]
    pub fn payload_remaining(&self) -> usize {
        self.header.payload_rem
    }

    /// Consume bytes from `input`.
    ///
    /// Stops at the end of input, when the sink stalls, or right after a
    /// control frame completes. Never consumes more than `input.len()`.
    ///
    /// # Errors
    ///
    /// - [`WsError::UnsupportedLength`] for the 64-bit length code
    /// - [`WsError::Protocol`] for a control frame longer than 125 bytes
    /// - [`WsError::OutOfMemory`] if the control reassembly buffer cannot be allocated
    pub fn parse<S: PayloadSink + ?Sized>(
        &mut self,
        input: &[u8],
        sink: &mut S,
    ) -> Result<Parsed> {
        let mut parsed = Parsed::default();

        loop {
            if !self.header.complete {
                if parsed.consumed == input.len() {
                    break;
                }
                parsed.consumed += self.read_header(&input[parsed.consumed..])?;
                if !self.header.complete {
                    break;
                }
                if self.header.payload_rem == 0 {
                    if let Some(control) = self.finish_frame(sink) {
                        parsed.control = Some(control);
                        break;
                    }
                    continue;
                }
            }

            let rest = &input[parsed.consumed..];
            if rest.is_empty() {
                break;
            }
            let available = rest.len().min(self.header.payload_rem);

            let used = match self.header.target {
                Target::Data(kind) => self.feed_data(kind, &rest[..available], sink),
                Target::Control(_) => self.feed_control(&rest[..available])?,
                Target::Discard => {
                    self.header.payload_rem -= available;
                    available
                }
            };
            parsed.consumed += used;

            if self.header.payload_rem == 0 {
                if let Some(control) = self.finish_frame(sink) {
                    parsed.control = Some(control);
                    break;
                }
            } else if used < available {
                parsed.stalled = true;
                break;
            }
        }

        Ok(parsed)
    }

    /// Collect header bytes. Returns the number consumed.
    fn read_header(&mut self, input: &[u8]) -> Result<usize> {
        let mut used = 0;
        let header = &mut self.header;

        while header.idx < header.need && used < input.len() {
            header.data[header.idx] = input[used];
            header.idx += 1;
            used += 1;

            if header.idx == 2 {
                header.need = match header.data[1] & bits::LEN_MASK {
                    LEN_64 => return Err(WsError::UnsupportedLength),
                    LEN_16 => CLIENT_HEADER_EXTENDED,
                    _ => CLIENT_HEADER_SHORT,
                };
            }
        }

        if header.idx == header.need {
            self.complete_header()?;
        }
        Ok(used)
    }

    fn complete_header(&mut self) -> Result<()> {
        let header = &mut self.header;
        let len7 = header.data[1] & bits::LEN_MASK;

        header.payload_len = if len7 == LEN_16 {
            u16::from_be_bytes([header.data[2], header.data[3]]) as usize
        } else {
            len7 as usize
        };
        header.payload_rem = header.payload_len;
        header.mask.copy_from_slice(&header.data[header.need - 4..header.need]);
        header.rx_index = 0;
        header.fin = header.data[0] & bits::FIN != 0;
        header.complete = true;

        let opcode = Opcode::from_u8(header.data[0]);
        header.target = match opcode {
            Some(op @ (Opcode::Text | Opcode::Binary)) => {
                self.fragment_opcode = if header.fin { None } else { Some(op) };
                Target::Data(kind_of(op))
            }
            Some(Opcode::Continuation) => match self.fragment_opcode {
                Some(op) => {
                    if header.fin {
                        self.fragment_opcode = None;
                    }
                    Target::Data(kind_of(op))
                }
                None => {
                    tracing::debug!("continuation frame without a message in progress, discarding");
                    Target::Discard
                }
            },
            Some(op) => {
                if header.payload_len > MAX_CONTROL_PAYLOAD {
                    return Err(WsError::Protocol(format!(
                        "control frame payload of {} bytes",
                        header.payload_len
                    )));
                }
                Target::Control(op)
            }
            None => {
                tracing::debug!(
                    opcode = header.data[0] & bits::OPCODE_MASK,
                    "unknown opcode, discarding payload"
                );
                Target::Discard
            }
        };
        Ok(())
    }

    fn feed_data<S: PayloadSink + ?Sized>(
        &mut self,
        kind: MessageKind,
        input: &[u8],
        sink: &mut S,
    ) -> usize {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let mut done = 0;

        while done < input.len() {
            let n = (input.len() - done).min(SCRATCH_SIZE);
            let chunk = &mut scratch[..n];
            chunk.copy_from_slice(&input[done..done + n]);
            apply_mask(chunk, self.header.mask, self.header.rx_index);

            let taken = sink.payload(kind, chunk).min(n);
            self.header.rx_index += taken;
            self.header.payload_rem -= taken;
            done += taken;
            if taken < n {
                break;
            }
        }
        done
    }

    fn feed_control(&mut self, input: &[u8]) -> Result<usize> {
        let header = &mut self.header;
        if header.reassembly.is_none() {
            let mut buf = Vec::new();
            buf.try_reserve_exact(header.payload_len)
                .map_err(|_| WsError::OutOfMemory(header.payload_len))?;
            header.reassembly = Some(buf);
        }
        let Some(buf) = header.reassembly.as_mut() else {
            return Ok(0);
        };

        let start = buf.len();
        buf.extend_from_slice(input);
        apply_mask(&mut buf[start..], header.mask, header.rx_index);
        header.rx_index += input.len();
        header.payload_rem -= input.len();
        Ok(input.len())
    }

    /// Act on a fully consumed frame and reset for the next one.
    fn finish_frame<S: PayloadSink + ?Sized>(&mut self, sink: &mut S) -> Option<ControlFrame> {
        let header = std::mem::replace(&mut self.header, FrameHeader::new());
        let payload = Bytes::from(header.reassembly.unwrap_or_default());

        match header.target {
            Target::Data(kind) => {
                if header.fin {
                    sink.message_end(kind);
                }
                None
            }
            Target::Control(Opcode::Close) => Some(ControlFrame::Close(payload)),
            Target::Control(Opcode::Ping) => Some(ControlFrame::Ping(payload)),
            Target::Control(Opcode::Pong) => Some(ControlFrame::Pong(payload)),
            Target::Control(_) | Target::Discard => None,
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_of(opcode: Opcode) -> MessageKind {
    if opcode == Opcode::Binary {
        MessageKind::Binary
    } else {
        MessageKind::Text
    }
}
