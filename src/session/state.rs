//! Per-connection protocol state.

use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;

use super::pool::SessionId;
use crate::config::ServerConfig;
use crate::handler::FrameHandlers;
use crate::handshake::RequestBuffer;
use crate::protocol::{FrameDecoder, FrameStart};
use crate::stream::StreamFlags;
use crate::transport::{Connection, PacketChain};

/// Connection state of a session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    /// Slot unused.
    Free,
    /// Accepted, waiting for the upgrade request.
    Connecting,
    /// Upgraded, exchanging frames.
    Connected,
    /// Close sent or liveness lost; torn down on the next poll.
    Closing,
}

/// Where received bytes go.
#[derive(Debug)]
pub(crate) enum Receiver {
    /// Accumulating the HTTP upgrade request.
    Handshake(RequestBuffer),
    /// Decoding frames.
    Frames(FrameDecoder),
}

/// Bounded accumulator for messages delivered to a frame handler.
#[derive(Debug)]
pub(crate) struct MessageInbox {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl MessageInbox {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append payload; anything past the limit marks the message truncated.
    pub(crate) fn push(&mut self, data: &[u8]) {
        if self.truncated {
            return;
        }
        if self.buf.len() + data.len() > self.limit || self.buf.try_reserve(data.len()).is_err() {
            self.truncated = true;
            self.buf = Vec::new();
            return;
        }
        self.buf.extend_from_slice(data);
    }

    /// Take the completed message, `None` if it was truncated.
    pub(crate) fn finish(&mut self) -> Option<Bytes> {
        let truncated = std::mem::take(&mut self.truncated);
        let message = Bytes::from(std::mem::take(&mut self.buf));
        (!truncated).then_some(message)
    }

    pub(crate) fn clear(&mut self) {
        self.buf = Vec::new();
        self.truncated = false;
    }
}

/// One client connection.
#[derive(Debug)]
pub struct Session<C> {
    id: SessionId,
    pub(crate) state: SessionState,
    pub(crate) conn: Option<C>,
    pub(crate) frame_start: FrameStart,
    pub(crate) receiver: Receiver,
    pub(crate) pending: PacketChain,
    pub(crate) ping_count: u8,
    pub(crate) last_send: Instant,
    pub(crate) timeout: u32,
    pub(crate) handlers: FrameHandlers,
    pub(crate) inbox: MessageInbox,
    pub(crate) flags: StreamFlags,
    pub(crate) protocol: Option<String>,
    stale: bool,
    accepted_seq: u64,
}

impl<C> Session<C> {
    /// An unused slot.
    pub(crate) fn free(id: SessionId, config: &ServerConfig, now: Instant) -> Self {
        Self {
            id,
            state: SessionState::Free,
            conn: None,
            frame_start: FrameStart::TEXT,
            receiver: Receiver::Handshake(RequestBuffer::new(config.max_http_header_size)),
            pending: PacketChain::new(),
            ping_count: 0,
            last_send: now,
            timeout: 0,
            handlers: FrameHandlers::new(),
            inbox: MessageInbox::new(config.max_message_size),
            flags: StreamFlags::default(),
            protocol: None,
            stale: false,
            accepted_seq: 0,
        }
    }

    /// A freshly accepted connection awaiting its upgrade request.
    pub(crate) fn connecting(
        id: SessionId,
        conn: C,
        config: &ServerConfig,
        now: Instant,
        accepted_seq: u64,
    ) -> Self {
        Self {
            state: SessionState::Connecting,
            conn: Some(conn),
            accepted_seq,
            ..Self::free(id, config, now)
        }
    }

    /// Handle of this session.
    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Connection state.
    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `true` for an unused slot.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == SessionState::Free
    }

    /// Token used for outgoing data frames.
    #[inline]
    pub fn frame_start(&self) -> FrameStart {
        self.frame_start
    }

    /// Selected sub-protocol.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Keepalive pings sent without an answer.
    #[inline]
    pub fn ping_count(&self) -> u8 {
        self.ping_count
    }

    /// Received bytes waiting for the next poll.
    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flagged by a link loss.
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub(crate) fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Accept order, for picking the oldest session.
    #[inline]
    pub fn accepted_seq(&self) -> u64 {
        self.accepted_seq
    }

    /// Transport connection, if still attached.
    pub fn conn(&self) -> Option<&C> {
        self.conn.as_ref()
    }

    pub(crate) fn take_conn(&mut self) -> Option<C> {
        self.conn.take()
    }

    /// Switch the receive path to frame decoding.
    pub(crate) fn start_frames(&mut self) {
        self.receiver = Receiver::Frames(FrameDecoder::new());
    }
}

impl<C: Connection> Session<C> {
    /// Drop undecoded input and acknowledge it, so the transport window reopens.
    pub(crate) fn discard_pending(&mut self) {
        let len = self.pending.len();
        self.pending.clear();
        if let Some(conn) = self.conn.as_mut() {
            conn.recved(len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_limit() {
        let mut inbox = MessageInbox::new(4);
        inbox.push(b"ab");
        inbox.push(b"cd");
        assert_eq!(inbox.finish(), Some(Bytes::from_static(b"abcd")));

        inbox.push(b"abc");
        inbox.push(b"de");
        inbox.push(b"f");
        assert_eq!(inbox.finish(), None);

        inbox.push(b"ok");
        assert_eq!(inbox.finish(), Some(Bytes::from_static(b"ok")));
    }

    #[test]
    fn test_connecting_session() {
        let config = ServerConfig::default();
        let session = Session::connecting(SessionId::new(1, 3), 42u32, &config, Instant::now(), 9);

        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.conn(), Some(&42));
        assert_eq!(session.accepted_seq(), 9);
        assert_eq!(session.frame_start(), FrameStart::TEXT);
        assert!(matches!(session.receiver, Receiver::Handshake(_)));
    }
}
