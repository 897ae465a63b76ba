//! Periodic pump: pending input, stream output and keepalive.

use bytes::Bytes;

use super::{Teardown, WebSocketServer, HEADER_MARGIN};
use crate::error::WsError;
use crate::handler::FrameHandlers;
use crate::protocol::{
    build_frame, close_code, ping_frame, ControlFrame, FrameStart, MessageKind, PayloadSink,
    MAX_PAYLOAD,
};
use crate::session::{MessageInbox, Receiver, SessionId, SessionState};
use crate::stream::{IoStream, StreamArbiter};
use crate::transport::Connection;

/// Routes decoded payload: handler inbox first, then the shared stream if
/// the session owns it, otherwise nowhere.
struct Router<'a> {
    session: SessionId,
    handlers: &'a FrameHandlers,
    inbox: &'a mut MessageInbox,
    stream: &'a mut StreamArbiter,
    completed: &'a mut Vec<(MessageKind, Bytes)>,
}

impl PayloadSink for Router<'_> {
    fn payload(&mut self, kind: MessageKind, data: &[u8]) -> usize {
        if self.handlers.has(kind) {
            self.inbox.push(data);
            data.len()
        } else if self.stream.is_owner(self.session) {
            self.stream.rx_put_slice(data)
        } else {
            data.len()
        }
    }

    fn message_end(&mut self, kind: MessageKind) {
        if !self.handlers.has(kind) {
            return;
        }
        match self.inbox.finish() {
            Some(message) => self.completed.push((kind, message)),
            None => tracing::warn!(session = %self.session, "message exceeds max_message_size, dropped"),
        }
    }
}

impl<C: Connection> WebSocketServer<C> {
    /// Service every session once.
    ///
    /// Closing sessions are torn down. Connected sessions get their pending
    /// input decoded, the stream output framed (owner only) and a keepalive
    /// ping when idle.
    pub fn poll(&mut self) {
        if self.stopped {
            return;
        }
        for id in self.pool.ids() {
            match self.session_state(id) {
                SessionState::Closing => self.teardown(id, Teardown::Close),
                SessionState::Connected => {
                    self.process_input(id);
                    self.flush_output(id);
                    self.keepalive(id);
                }
                SessionState::Connecting | SessionState::Free => {}
            }
        }
    }

    /// Decode pending input of `id` until it is exhausted or the stream stalls.
    pub(super) fn process_input(&mut self, id: SessionId) {
        let mut completed = Vec::new();

        loop {
            let Some(session) = self.pool.get_mut(id) else {
                break;
            };
            if session.state() != SessionState::Connected {
                break;
            }
            let Receiver::Frames(decoder) = &mut session.receiver else {
                break;
            };
            let Some(input) = session.pending.front() else {
                break;
            };

            let mut router = Router {
                session: id,
                handlers: &session.handlers,
                inbox: &mut session.inbox,
                stream: &mut self.stream,
                completed: &mut completed,
            };
            let result = decoder.parse(input, &mut router);

            let parsed = match result {
                Ok(parsed) => parsed,
                Err(err) => {
                    decoder.reset();
                    session.discard_pending();
                    session.inbox.clear();
                    self.protocol_failure(id, err);
                    break;
                }
            };

            session.pending.advance(parsed.consumed);
            if let Some(conn) = session.conn.as_mut() {
                conn.recved(parsed.consumed);
            }

            if !completed.is_empty() {
                self.deliver(id, std::mem::take(&mut completed));
            }
            if let Some(control) = parsed.control {
                self.handle_control(id, control);
                continue;
            }
            if parsed.stalled || parsed.consumed == 0 {
                break;
            }
        }
    }

    /// Answer a completed control frame.
    fn handle_control(&mut self, id: SessionId, control: ControlFrame) {
        match control {
            ControlFrame::Close(payload) => {
                tracing::debug!(session = %id, "close received");
                if let Err(err) = self.write_frame(id, FrameStart::CLOSE, &payload) {
                    tracing::debug!(session = %id, error = %err, "close echo not sent");
                }
                if let Some(session) = self.pool.get_mut(id) {
                    session.discard_pending();
                }
                self.enter_closing(id);
            }
            ControlFrame::Ping(payload) => {
                tracing::debug!(session = %id, len = payload.len(), "ping received");
                if let Err(err) = self.write_frame(id, FrameStart::PONG, &payload) {
                    tracing::debug!(session = %id, error = %err, "pong not sent");
                }
            }
            ControlFrame::Pong(_) => {
                if let Some(session) = self.pool.get_mut(id) {
                    session.ping_count = 0;
                }
            }
        }
    }

    /// Close a session after a decoding failure.
    fn protocol_failure(&mut self, id: SessionId, err: WsError) {
        tracing::warn!(session = %id, error = %err, "frame decoding failed");
        self.stats.protocol_errors += 1;
        self.stats.record_error(&err);

        match err {
            WsError::UnsupportedLength => self.start_close(id, close_code::TOO_BIG),
            WsError::OutOfMemory(_) => {
                self.start_close(id, close_code::INTERNAL_ERROR);
                self.teardown(id, Teardown::Abort);
            }
            _ => self.start_close(id, close_code::PROTOCOL_ERROR),
        }
    }

    /// Wrap pending stream output of the owner into one frame.
    fn flush_output(&mut self, id: SessionId) {
        if !self.stream.is_owner(id) || self.stream.tx_count() == 0 {
            return;
        }
        let now = self.clock.now();
        let Some(session) = self.pool.get_mut(id) else {
            return;
        };
        let Some(conn) = session.conn.as_mut() else {
            return;
        };

        let len = self
            .stream
            .tx_count()
            .min(conn.send_buffer().saturating_sub(HEADER_MARGIN))
            .min(self.stream.tx_capacity())
            .min(MAX_PAYLOAD);
        if len == 0 {
            return;
        }

        let mut payload = vec![0u8; len];
        let len = self.stream.tx_peek(&mut payload);
        let frame = match build_frame(session.frame_start, &payload[..len]) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(session = %id, error = %err, "output frame not built");
                return;
            }
        };

        match conn.write(&frame) {
            Ok(()) => {
                self.stream.tx_consume(len);
                session.last_send = now;
            }
            Err(err) => tracing::debug!(session = %id, error = %err, "output deferred"),
        }
    }

    /// Ping an idle session; close it after too many unanswered pings.
    fn keepalive(&mut self, id: SessionId) {
        let now = self.clock.now();
        let interval = self.config.ping_interval();
        let max_missed = self.config.max_missed_pings;
        let Some(session) = self.pool.get_mut(id) else {
            return;
        };
        if session.state() != SessionState::Connected {
            return;
        }

        if session.ping_count > max_missed {
            tracing::info!(session = %id, pings = session.ping_count, "keepalive lost");
            self.enter_closing(id);
            return;
        }
        if now.saturating_duration_since(session.last_send) <= interval {
            return;
        }
        let Some(conn) = session.conn.as_mut() else {
            return;
        };
        if conn.send_buffer() <= HEADER_MARGIN {
            return;
        }
        match conn.write(&ping_frame()) {
            Ok(()) => {
                session.ping_count += 1;
                session.last_send = now;
                tracing::debug!(session = %id, pings = session.ping_count, "ping sent");
            }
            Err(err) => tracing::debug!(session = %id, error = %err, "ping deferred"),
        }
    }
}
