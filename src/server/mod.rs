//! Server builder and the cooperative WebSocket core.
//!
//! [`WebSocketServer`] owns the session table and the stream arbiter. It is
//! driven from outside:
//! 1. The transport reports new connections ([`accept`](WebSocketServer::accept)),
//!    received data ([`receive`](WebSocketServer::receive)), end of stream,
//!    errors, poll ticks and send completions
//! 2. The application calls [`poll`](WebSocketServer::poll) periodically to
//!    drain pending input, frame pending output and send keepalive pings
//!
//! # Example
//!
//! ```
//! use websocketd::transport::{Connection, WriteError};
//! use websocketd::ServerBuilder;
//!
//! #[derive(Default)]
//! struct Recorder(Vec<u8>);
//!
//! impl Connection for Recorder {
//!     fn write(&mut self, data: &[u8]) -> Result<(), WriteError> {
//!         self.0.extend_from_slice(data);
//!         Ok(())
//!     }
//!     fn send_buffer(&self) -> usize { 4096 }
//!     fn close(&mut self) -> Result<(), WriteError> { Ok(()) }
//!     fn abort(&mut self) {}
//! }
//!
//! let mut server = ServerBuilder::new().port(8081).build().unwrap();
//! let id = server.accept(Recorder::default()).unwrap();
//!
//! server
//!     .receive(id, "GET / HTTP/1.1\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n")
//!     .unwrap();
//! assert!(server.is_connected(id));
//! assert_eq!(server.stream().owner(), Some(id));
//! ```

mod listener;
mod poller;

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::error::{Result, WsError};
use crate::handler::{FrameContext, FrameHandlers};
use crate::handshake::{first_protocol, BINARY_PROTOCOL};
use crate::protocol::{build_frame, close_frame, FrameStart, MessageKind};
use crate::session::{Session, SessionId, SessionPool, SessionState};
use crate::stream::{IoStream, RealtimeHandler, StreamArbiter, StreamEvent, StreamFlags};
use crate::transport::Connection;

/// Bytes kept free in the send buffer for a frame header.
pub const HEADER_MARGIN: usize = 4;

/// Application hooks. Every method has a default.
pub trait ServerEvents {
    /// Pick the sub-protocol from the offered list.
    ///
    /// Default: the first entry, with `arduino` switching to binary frames.
    fn on_protocol_select(
        &mut self,
        _session: SessionId,
        offered: &str,
        is_binary: &mut bool,
    ) -> Option<String> {
        default_protocol_select(offered, is_binary)
    }

    /// A session completed the upgrade. Handlers installed here receive its
    /// messages from the first frame on.
    fn on_client_connect(&mut self, _session: SessionId, _handlers: &mut FrameHandlers) {}

    /// A connected session ended.
    fn on_client_disconnect(&mut self, _session: SessionId) {}

    /// The shared stream was claimed or released.
    fn on_stream_change(&mut self, _event: StreamEvent) {}
}

/// Hooks that keep every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEvents;

impl ServerEvents for DefaultEvents {}

/// First offered protocol; `arduino` selects binary frames.
pub fn default_protocol_select(offered: &str, is_binary: &mut bool) -> Option<String> {
    let protocol = first_protocol(offered);
    if protocol.is_empty() {
        return None;
    }
    if protocol == BINARY_PROTOCOL {
        *is_binary = true;
    }
    Some(protocol.to_string())
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    /// Connections given a session slot.
    pub accepted: u64,
    /// Connections refused for lack of a slot.
    pub refused: u64,
    /// Stale sessions aborted to make room after a link loss.
    pub reclaimed: u64,
    /// Upgrade requests answered with 400 or 500.
    pub handshake_failures: u64,
    /// Sessions closed for a frame level violation.
    pub protocol_errors: u64,
    /// Error callbacks from the transport.
    pub transport_errors: u64,
    /// Connections aborted by the socket timeout.
    pub timeouts: u64,
    /// Sessions returned to `Free`.
    pub closed: u64,
    /// Description of the most recent failure.
    pub last_error: Option<String>,
}

impl ServerStats {
    fn record_error(&mut self, err: &WsError) {
        self.last_error = Some(err.to_string());
    }
}

/// How a session leaves its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Graceful close, falling back to abort.
    Close,
    /// Immediate abort.
    Abort,
    /// Transport already gone.
    Gone,
}

/// Builder for [`WebSocketServer`].
pub struct ServerBuilder {
    config: ServerConfig,
    clock: Box<dyn Clock>,
    events: Box<dyn ServerEvents>,
    realtime: Option<RealtimeHandler>,
}

impl ServerBuilder {
    /// Builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            clock: Box::new(SystemClock),
            events: Box::new(DefaultEvents),
            realtime: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Listening port (used by the TCP front-end).
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Session pool capacity.
    ///
    /// Default: 4
    pub fn max_sessions(mut self, max_sessions: usize) -> Self {
        self.config.max_sessions = max_sessions;
        self
    }

    /// Idle time before a keepalive ping.
    ///
    /// Default: 3 seconds
    pub fn ping_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.ping_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Let the first connected session claim the stream.
    ///
    /// Default: true
    pub fn auto_claim(mut self, auto_claim: bool) -> Self {
        self.config.auto_claim = auto_claim;
        self
    }

    /// Time source for keepalive timing.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Application hooks.
    pub fn events(mut self, events: impl ServerEvents + 'static) -> Self {
        self.events = Box::new(events);
        self
    }

    /// Realtime command filter for inbound stream bytes.
    pub fn realtime_handler(mut self, handler: impl FnMut(u8) -> bool + 'static) -> Self {
        self.realtime = Some(Box::new(handler));
        self
    }

    /// Validate the configuration and build the server.
    pub fn build<C: Connection>(self) -> Result<WebSocketServer<C>> {
        self.config.validate()?;
        let now = self.clock.now();
        let mut stream = StreamArbiter::new(self.config.rx_buffer_size, self.config.tx_buffer_size);
        if let Some(handler) = self.realtime {
            stream.set_enqueue_rt_handler(handler);
        }

        Ok(WebSocketServer {
            pool: SessionPool::new(&self.config, now),
            stream,
            config: self.config,
            clock: self.clock,
            events: self.events,
            stats: ServerStats::default(),
            link_lost: false,
            stopped: false,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative WebSocket server core.
pub struct WebSocketServer<C: Connection> {
    config: ServerConfig,
    clock: Box<dyn Clock>,
    events: Box<dyn ServerEvents>,
    pool: SessionPool<C>,
    stream: StreamArbiter,
    stats: ServerStats,
    link_lost: bool,
    stopped: bool,
}

impl<C: Connection> fmt::Debug for WebSocketServer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("port", &self.config.port)
            .field("sessions", &self.pool.active())
            .field("stream", &self.stream)
            .field("stats", &self.stats)
            .field("link_lost", &self.link_lost)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl<C: Connection> WebSocketServer<C> {
    /// Create a server builder.
    ///
    /// The connection type usually has to be named here
    /// (`WebSocketServer::<MyConn>::builder()`); [`ServerBuilder::new`]
    /// leaves it to inference at [`ServerBuilder::build`].
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Create a server with `config` and the system clock.
    pub fn new(config: ServerConfig) -> Result<Self> {
        ServerBuilder::new().config(config).build()
    }

    /// Active configuration.
    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Diagnostic counters.
    #[inline]
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// The shared stream.
    #[inline]
    pub fn stream(&self) -> &StreamArbiter {
        &self.stream
    }

    /// The shared stream, for reading input and writing output.
    #[inline]
    pub fn stream_mut(&mut self) -> &mut StreamArbiter {
        &mut self.stream
    }

    /// Look up a live session.
    pub fn session(&self, id: SessionId) -> Option<&Session<C>> {
        self.pool.get(id)
    }

    /// State of `id`; `Free` for unknown or ended sessions.
    pub fn session_state(&self, id: SessionId) -> SessionState {
        self.pool.get(id).map_or(SessionState::Free, Session::state)
    }

    /// `true` if `id` is upgraded and not closing.
    pub fn is_connected(&self, id: SessionId) -> bool {
        self.session_state(id) == SessionState::Connected
    }

    /// Handles of all live sessions.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.pool.ids()
    }

    /// `true` after [`stop`](Self::stop).
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Record a change of the network link.
    ///
    /// On link loss every live session is flagged stale. While the pool is
    /// full, a new connection then aborts the oldest stale session and takes
    /// its slot.
    pub fn notify_link_status(&mut self, up: bool) {
        if up {
            tracing::debug!("link up");
            return;
        }
        tracing::info!(sessions = self.pool.active(), "link lost");
        self.link_lost = true;
        for session in self.pool.iter_mut() {
            session.mark_stale();
        }
    }

    /// Abort every connection, release the stream and refuse new ones.
    pub fn stop(&mut self) {
        for id in self.pool.ids() {
            self.teardown(id, Teardown::Abort);
        }
        self.stopped = true;
        tracing::info!("server stopped");
    }

    /// Release the stream and close every session gracefully.
    pub fn close_connections(&mut self) {
        if let Some(owner) = self.stream.owner() {
            self.release_stream(owner);
        }
        for id in self.pool.ids() {
            self.teardown(id, Teardown::Close);
        }
    }

    /// Route complete `kind` messages of `id` to `handler` instead of the stream.
    ///
    /// Returns the handler it replaces.
    pub fn register_frame_handler(
        &mut self,
        id: SessionId,
        kind: MessageKind,
        handler: impl FnMut(&mut FrameContext, &[u8]) + 'static,
    ) -> Result<Option<crate::handler::FrameHandler>> {
        let session = self.pool.get_mut(id).ok_or(WsError::InvalidSession)?;
        Ok(session.handlers.register(kind, Box::new(handler)))
    }

    /// Send one data frame to `id`.
    ///
    /// # Errors
    ///
    /// - [`WsError::InvalidSession`] / [`WsError::NotConnected`]
    /// - [`WsError::FrameTooLarge`] for payloads over 65535 bytes
    /// - [`WsError::Write`] if the transport has no room
    pub fn send_frame(&mut self, id: SessionId, data: &[u8], is_binary: bool) -> Result<()> {
        self.write_frame(id, FrameStart::data(is_binary), data)
    }

    /// Send a data frame to every connected session.
    ///
    /// Returns how many sessions accepted it.
    pub fn broadcast_frame(&mut self, data: &[u8], is_binary: bool) -> Result<usize> {
        let frame = build_frame(FrameStart::data(is_binary), data)?;
        let mut sent = 0;
        for id in self.pool.in_state(SessionState::Connected) {
            match self.write_raw(id, &frame) {
                Ok(()) => sent += 1,
                Err(err) => tracing::debug!(session = %id, error = %err, "broadcast skipped session"),
            }
        }
        Ok(sent)
    }

    /// Set the flags published when `id` owns the stream.
    pub fn set_stream_flags(&mut self, id: SessionId, flags: StreamFlags) -> Result<()> {
        let session = self.pool.get_mut(id).ok_or(WsError::InvalidSession)?;
        session.flags = flags;
        if self.stream.is_owner(id) {
            self.stream.set_flags(flags);
        }
        Ok(())
    }

    /// Make `id` the owner of the shared stream.
    ///
    /// Returns `Ok(false)` if it already owns it.
    ///
    /// # Errors
    ///
    /// - [`WsError::NotConnected`] unless `id` is connected
    /// - [`WsError::StreamBusy`] if another session owns the stream
    pub fn claim_stream(&mut self, id: SessionId) -> Result<bool> {
        let session = self.pool.get(id).ok_or(WsError::InvalidSession)?;
        if session.state() != SessionState::Connected {
            return Err(WsError::NotConnected);
        }
        let flags = session.flags;
        let claimed = self.stream.claim(id, flags)?;
        if claimed {
            tracing::info!(session = %id, "stream claimed");
            self.events.on_stream_change(StreamEvent::Connected {
                session: id,
                flags: self.stream.state(),
            });
        }
        Ok(claimed)
    }

    /// Give up the stream if `id` owns it.
    pub fn release_stream(&mut self, id: SessionId) -> bool {
        if !self.stream.release(id) {
            return false;
        }
        tracing::info!(session = %id, "stream released");
        self.events.on_stream_change(StreamEvent::Disconnected { session: id });
        true
    }

    /// Frame and write `payload` to a connected session.
    fn write_frame(&mut self, id: SessionId, start: FrameStart, payload: &[u8]) -> Result<()> {
        let frame = build_frame(start, payload)?;
        self.write_raw(id, &frame)
    }

    /// Write an encoded frame to a connected session.
    fn write_raw(&mut self, id: SessionId, frame: &[u8]) -> Result<()> {
        let now = self.clock.now();
        let session = self.pool.get_mut(id).ok_or(WsError::InvalidSession)?;
        if session.state() != SessionState::Connected {
            return Err(WsError::NotConnected);
        }
        let conn = session.conn.as_mut().ok_or(WsError::NotConnected)?;
        conn.write(frame)?;
        session.last_send = now;
        Ok(())
    }

    /// Send a Close with `code` (best effort) and move to `Closing`.
    fn start_close(&mut self, id: SessionId, code: u16) {
        let frame = close_frame(code);
        if let Err(err) = self.write_raw(id, &frame) {
            tracing::debug!(session = %id, error = %err, "close frame not sent");
        }
        self.enter_closing(id);
    }

    /// Move `id` to `Closing`. The stream is released right away; the slot
    /// is freed on the next poll.
    fn enter_closing(&mut self, id: SessionId) {
        let Some(session) = self.pool.get_mut(id) else {
            return;
        };
        session.state = SessionState::Closing;
        self.release_stream(id);
    }

    /// Run handlers for completed messages and send their replies.
    fn deliver(&mut self, id: SessionId, messages: Vec<(MessageKind, Bytes)>) {
        for (kind, message) in messages {
            let Some(session) = self.pool.get_mut(id) else {
                return;
            };
            let mut ctx = FrameContext::new(id, kind);
            session.handlers.dispatch(kind, &mut ctx, &message);

            let close = ctx.close_requested();
            for reply in ctx.into_replies() {
                if let Err(err) = self.write_frame(id, reply.start, &reply.payload) {
                    tracing::warn!(session = %id, error = %err, "handler reply dropped");
                }
            }
            if close {
                self.start_close(id, crate::protocol::close_code::NORMAL);
            }
        }
    }

    /// Return a session slot to `Free`.
    fn teardown(&mut self, id: SessionId, how: Teardown) {
        let Some(session) = self.pool.get(id) else {
            return;
        };
        let was_upgraded = matches!(session.state(), SessionState::Connected | SessionState::Closing);

        self.release_stream(id);

        let now = self.clock.now();
        if let Some(mut conn) = self.pool.release(id, &self.config, now) {
            match how {
                Teardown::Close => {
                    if conn.close().is_err() {
                        conn.abort();
                    }
                }
                Teardown::Abort => conn.abort(),
                Teardown::Gone => {}
            }
        }
        self.stats.closed += 1;
        tracing::info!(session = %id, how = ?how, "session closed");

        if was_upgraded {
            self.events.on_client_disconnect(id);
        }
    }
}
