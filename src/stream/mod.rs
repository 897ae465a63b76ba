//! Stream module - the single console byte stream shared by all sessions.
//!
//! - [`RingBuffer`]: head/tail byte ring that refuses writes when full
//! - [`StreamArbiter`]: exclusive ownership and the shared RX/TX rings
//! - [`IoStream`]: the character stream interface the application reads and writes

mod arbiter;
mod ring;

pub use arbiter::{StreamArbiter, StreamEvent, StreamFlags};
pub use ring::{RingBuffer, ASCII_CAN};

/// Realtime command filter. Returns `true` if the byte was consumed.
pub type RealtimeHandler = Box<dyn FnMut(u8) -> bool>;

/// Character stream interface published to the application.
///
/// All operations are non-blocking. Writes that do not fit are truncated and
/// report how much was accepted.
pub trait IoStream {
    /// Published flags (`connected` is set while a session owns the stream).
    fn state(&self) -> StreamFlags;

    /// Next input byte, `None` if empty or suspended.
    fn read_char(&mut self) -> Option<u8>;

    /// Queue one output byte.
    fn write_char(&mut self, byte: u8) -> bool;

    /// Queue output bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Queue a string.
    fn write_str(&mut self, s: &str) -> usize {
        self.write(s.as_bytes())
    }

    /// Free input space.
    fn rx_free(&self) -> usize;

    /// Buffered input.
    fn rx_count(&self) -> usize;

    /// Buffered output.
    fn tx_count(&self) -> usize;

    /// Discard buffered input.
    fn reset_read_buffer(&mut self);

    /// Discard buffered input and leave a CAN byte.
    fn cancel_read_buffer(&mut self);

    /// Hold or resume input delivery. Returns the new state.
    fn suspend_read(&mut self, suspend: bool) -> bool;

    /// Pass a byte to the realtime handler.
    fn enqueue_rt_command(&mut self, byte: u8) -> bool;

    /// Install a realtime handler, returning the previous one.
    fn set_enqueue_rt_handler(&mut self, handler: RealtimeHandler) -> Option<RealtimeHandler>;
}
