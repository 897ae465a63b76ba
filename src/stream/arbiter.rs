//! Ownership of the shared console stream.
//!
//! At most one session owns the stream. Only the owner's decoded payload is
//! buffered in the RX ring and only the owner's frames carry the TX ring.
//! Releasing flushes both rings so the next owner starts clean.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ring::RingBuffer;
use super::{IoStream, RealtimeHandler};
use crate::error::{Result, WsError};
use crate::session::SessionId;

/// Flags published with the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFlags {
    /// A session owns the stream.
    pub connected: bool,
    /// Raw passthrough mode requested by the client.
    pub passthru: bool,
    /// Client expects UTF-8 output.
    pub utf8: bool,
    /// Connection comes from the bundled web UI.
    pub webui_connected: bool,
}

/// Change of stream ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// `session` now owns the stream.
    Connected {
        /// New owner.
        session: SessionId,
        /// Flags at claim time.
        flags: StreamFlags,
    },
    /// `session` gave the stream up.
    Disconnected {
        /// Previous owner.
        session: SessionId,
    },
}

/// Owner of the shared RX/TX rings.
pub struct StreamArbiter {
    owner: Option<SessionId>,
    flags: StreamFlags,
    rx: RingBuffer,
    tx: RingBuffer,
    suspended: bool,
    realtime: Option<RealtimeHandler>,
}

impl fmt::Debug for StreamArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamArbiter")
            .field("owner", &self.owner)
            .field("flags", &self.flags)
            .field("rx", &self.rx.count())
            .field("tx", &self.tx.count())
            .field("suspended", &self.suspended)
            .finish()
    }
}

impl StreamArbiter {
    /// Create an unowned arbiter with rings of the given sizes.
    pub fn new(rx_size: usize, tx_size: usize) -> Self {
        Self {
            owner: None,
            flags: StreamFlags::default(),
            rx: RingBuffer::new(rx_size),
            tx: RingBuffer::new(tx_size),
            suspended: false,
            realtime: None,
        }
    }

    /// Current owner.
    #[inline]
    pub fn owner(&self) -> Option<SessionId> {
        self.owner
    }

    /// `true` if `session` owns the stream.
    #[inline]
    pub fn is_owner(&self, session: SessionId) -> bool {
        self.owner == Some(session)
    }

    /// Give the stream to `session`.
    ///
    /// Returns `Ok(true)` on a new claim and `Ok(false)` if `session` already
    /// owns it.
    ///
    /// # Errors
    ///
    /// [`WsError::StreamBusy`] if another session owns the stream.
    pub fn claim(&mut self, session: SessionId, flags: StreamFlags) -> Result<bool> {
        match self.owner {
            Some(owner) if owner == session => Ok(false),
            Some(_) => Err(WsError::StreamBusy),
            None => {
                self.owner = Some(session);
                self.flags = StreamFlags {
                    connected: true,
                    ..flags
                };
                self.rx.flush();
                self.rx.take_overflow();
                self.suspended = false;
                Ok(true)
            }
        }
    }

    /// Drop ownership if `session` holds it. Returns `true` if released.
    pub fn release(&mut self, session: SessionId) -> bool {
        if self.owner != Some(session) {
            return false;
        }
        self.owner = None;
        self.flags = StreamFlags::default();
        self.rx.flush();
        self.rx.take_overflow();
        self.tx.flush();
        self.suspended = false;
        true
    }

    /// Replace the published flags of the owner. `connected` is kept.
    pub fn set_flags(&mut self, flags: StreamFlags) {
        self.flags = StreamFlags {
            connected: self.owner.is_some(),
            ..flags
        };
    }

    /// Offer one inbound byte to the realtime handler, then to the RX ring.
    ///
    /// Returns `false` when there is no owner or the ring is full.
    pub fn rx_put_char(&mut self, byte: u8) -> bool {
        if self.owner.is_none() {
            return false;
        }
        if let Some(handler) = self.realtime.as_mut() {
            if handler(byte) {
                return true;
            }
        }
        self.rx.put(byte)
    }

    /// Offer bytes in order, stopping at the first refusal.
    pub fn rx_put_slice(&mut self, bytes: &[u8]) -> usize {
        bytes.iter().take_while(|&&b| self.rx_put_char(b)).count()
    }

    /// Read and clear the sticky RX overflow flag.
    pub fn take_overflow(&mut self) -> bool {
        self.rx.take_overflow()
    }

    /// Copy pending output without removing it.
    pub fn tx_peek(&self, out: &mut [u8]) -> usize {
        self.tx.peek_into(out)
    }

    /// Remove `n` bytes of output after they were sent.
    pub fn tx_consume(&mut self, n: usize) {
        self.tx.consume(n);
    }

    /// TX ring capacity.
    #[inline]
    pub fn tx_capacity(&self) -> usize {
        self.tx.capacity()
    }
}

impl IoStream for StreamArbiter {
    fn state(&self) -> StreamFlags {
        self.flags
    }

    fn read_char(&mut self) -> Option<u8> {
        if self.suspended {
            return None;
        }
        self.rx.get()
    }

    fn write_char(&mut self, byte: u8) -> bool {
        self.owner.is_some() && self.tx.put(byte)
    }

    fn write(&mut self, data: &[u8]) -> usize {
        if self.owner.is_none() {
            return 0;
        }
        self.tx.put_slice(data)
    }

    fn rx_free(&self) -> usize {
        self.rx.free()
    }

    fn rx_count(&self) -> usize {
        self.rx.count()
    }

    fn tx_count(&self) -> usize {
        self.tx.count()
    }

    fn reset_read_buffer(&mut self) {
        self.rx.flush();
    }

    fn cancel_read_buffer(&mut self) {
        self.rx.cancel();
    }

    fn suspend_read(&mut self, suspend: bool) -> bool {
        self.suspended = suspend;
        self.suspended
    }

    fn enqueue_rt_command(&mut self, byte: u8) -> bool {
        match self.realtime.as_mut() {
            Some(handler) => handler(byte),
            None => false,
        }
    }

    fn set_enqueue_rt_handler(&mut self, handler: RealtimeHandler) -> Option<RealtimeHandler> {
        self.realtime.replace(handler)
    }
}
