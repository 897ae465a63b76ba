//! Protocol module - RFC 6455 wire format, incremental decoding and outgoing frames.
//!
//! - header encoding/decoding and payload masking
//! - incremental client frame decoder with resumable unmasking
//! - server frame construction (data, ping, close)

mod decoder;
mod frame;
mod wire_format;

pub use decoder::{ControlFrame, FrameDecoder, MessageKind, PayloadSink, Parsed};
pub use frame::{build_frame, close_code, close_frame, ping_frame, Frame, PING_PAYLOAD};
pub use wire_format::{
    apply_mask, bits, header_len, FrameStart, Opcode, ServerHeader, CLIENT_HEADER_EXTENDED,
    CLIENT_HEADER_SHORT, MAX_CONTROL_PAYLOAD, MAX_PAYLOAD, MAX_SERVER_HEADER, MAX_SHORT_PAYLOAD,
};
