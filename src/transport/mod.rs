//! Transport module - the TCP collaborator seen by the core.
//!
//! The core never touches sockets. Each accepted connection is represented
//! by a [`Connection`] the core writes into, and received data is handed to
//! the server as [`bytes::Bytes`] segments kept in a [`PacketChain`].
//!
//! - [`Connection`]: write/close/abort plus send-buffer accounting
//! - [`PacketChain`]: cursor over not yet processed receive segments
//! - [`tcp`]: tokio front-end driving the core over real sockets

mod chain;
pub mod tcp;

pub use chain::PacketChain;

use thiserror::Error;

/// Why a write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    /// Send buffer or queue has no room for the data right now.
    #[error("send buffer full")]
    Full,
    /// Connection is closing or gone.
    #[error("connection closed")]
    Closed,
}

/// A transport connection owned by the network layer.
///
/// Writes are all-or-nothing: either every byte is queued or the call fails
/// with [`WriteError::Full`] and nothing is queued.
pub trait Connection {
    /// Queue `data` for transmission.
    fn write(&mut self, data: &[u8]) -> Result<(), WriteError>;

    /// Free space in the send buffer, in bytes.
    fn send_buffer(&self) -> usize;

    /// `true` if the send queue cannot take another segment.
    fn send_queue_full(&self) -> bool {
        false
    }

    /// Acknowledge `len` processed receive bytes.
    fn recved(&mut self, _len: usize) {}

    /// Start a graceful close.
    fn close(&mut self) -> Result<(), WriteError>;

    /// Drop the connection immediately.
    fn abort(&mut self);
}

/// Write as much of `data` as the connection accepts.
///
/// The first attempt is clamped to the free send buffer. On
/// [`WriteError::Full`] the length is halved, or dropped to one byte when the
/// buffer is empty or the queue full, and retried while more than one byte
/// is being attempted. Returns the number of bytes queued.
///
/// # Example
///
/// ```
/// use websocketd::transport::{write_partial, Connection, WriteError};
///
/// struct Small(Vec<u8>);
///
/// impl Connection for Small {
///     fn write(&mut self, data: &[u8]) -> Result<(), WriteError> {
///         if data.len() > 8 {
///             return Err(WriteError::Full);
///         }
///         self.0.extend_from_slice(data);
///         Ok(())
///     }
///     fn send_buffer(&self) -> usize { 64 }
///     fn close(&mut self) -> Result<(), WriteError> { Ok(()) }
///     fn abort(&mut self) {}
/// }
///
/// let mut conn = Small(Vec::new());
/// assert_eq!(write_partial(&mut conn, &[0u8; 40]), Ok(5));
/// ```
pub fn write_partial<C: Connection + ?Sized>(conn: &mut C, data: &[u8]) -> Result<usize, WriteError> {
    if data.is_empty() {
        return Ok(0);
    }
    let mut len = data.len().min(conn.send_buffer());
    if len == 0 {
        return Err(WriteError::Full);
    }

    loop {
        match conn.write(&data[..len]) {
            Ok(()) => return Ok(len),
            Err(WriteError::Full) => {
                len = if conn.send_buffer() == 0 || conn.send_queue_full() {
                    1
                } else {
                    len / 2
                };
                if len <= 1 {
                    return Err(WriteError::Full);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Write all of `data` with repeated [`write_partial`] calls.
///
/// Used for short best-effort replies; gives up on the first refusal.
pub fn write_all<C: Connection + ?Sized>(conn: &mut C, data: &[u8]) -> Result<(), WriteError> {
    let mut offset = 0;
    while offset < data.len() {
        offset += write_partial(conn, &data[offset..])?;
    }
    Ok(())
}
