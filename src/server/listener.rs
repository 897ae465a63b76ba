//! Transport callbacks: accept, receive, errors and timeouts.

use bytes::Bytes;

use super::{Teardown, WebSocketServer};
use crate::error::{Result, WsError};
use crate::handshake::{response_101, UpgradeRequest, HTTP_400, HTTP_500};
use crate::protocol::FrameStart;
use crate::session::{Receiver, SessionId, SessionState};
use crate::transport::{write_all, Connection};

impl<C: Connection> WebSocketServer<C> {
    /// Give a newly accepted connection a session slot.
    ///
    /// With a full pool the connection is aborted and refused, unless a link
    /// loss left stale sessions behind: then the oldest of those is aborted
    /// and its slot reused.
    ///
    /// # Errors
    ///
    /// - [`WsError::Stopped`] after [`stop`](Self::stop)
    /// - [`WsError::PoolExhausted`] if no slot can be found
    pub fn accept(&mut self, mut conn: C) -> Result<SessionId> {
        if self.stopped {
            conn.abort();
            return Err(WsError::Stopped);
        }

        let now = self.clock.now();
        let conn = match self.pool.allocate(conn, &self.config, now) {
            Ok(id) => return Ok(self.accepted(id)),
            Err(conn) => conn,
        };

        if let Some(stale) = self.link_lost.then(|| self.pool.oldest_stale()).flatten() {
            tracing::warn!(session = %stale, "link was lost, reclaiming stale session");
            self.teardown(stale, Teardown::Abort);
            self.stats.reclaimed += 1;
            if self.pool.oldest_stale().is_none() {
                self.link_lost = false;
            }
            if let Ok(id) = self.pool.allocate(conn, &self.config, now) {
                return Ok(self.accepted(id));
            }
            // Slot reuse cannot fail right after a release.
            return Err(WsError::PoolExhausted(self.pool.capacity()));
        }

        let mut conn = conn;
        conn.abort();
        self.stats.refused += 1;
        let err = WsError::PoolExhausted(self.pool.capacity());
        tracing::warn!(error = %err, "connection refused");
        self.stats.record_error(&err);
        Err(err)
    }

    fn accepted(&mut self, id: SessionId) -> SessionId {
        self.stats.accepted += 1;
        tracing::debug!(session = %id, "connection accepted");
        id
    }

    /// Data received on the connection of `id`.
    ///
    /// During the handshake the bytes are accumulated until the request is
    /// complete. After it, they are queued behind any input still pending
    /// and decoded right away as far as the stream allows.
    ///
    /// Queued input is acknowledged through [`Connection::recved`] as it is
    /// decoded. A transport that reads only what was acknowledged, up to
    /// `max_pending`, never sees [`WsError::WindowFull`].
    ///
    /// # Errors
    ///
    /// - [`WsError::InvalidSession`] for an unknown handle
    /// - [`WsError::WindowFull`] if queuing `data` would exceed `max_pending`;
    ///   nothing was queued and the segment must be delivered again later
    pub fn receive(&mut self, id: SessionId, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let session = self.pool.get_mut(id).ok_or(WsError::InvalidSession)?;

        match session.state() {
            SessionState::Connecting => self.handshake(id, data),
            SessionState::Connected => {
                let queued = session.pending.len();
                if queued > 0 && queued + data.len() > self.config.max_pending {
                    tracing::debug!(session = %id, queued, len = data.len(), "receive window full");
                    return Err(WsError::WindowFull(queued));
                }
                session.pending.push(data);
                self.process_input(id);
                Ok(())
            }
            SessionState::Closing | SessionState::Free => {
                if let Some(conn) = session.conn.as_mut() {
                    conn.recved(data.len());
                }
                Ok(())
            }
        }
    }

    /// The peer closed its side of the connection.
    pub fn receive_closed(&mut self, id: SessionId) {
        if self.pool.get(id).is_some() {
            tracing::debug!(session = %id, "peer closed connection");
            self.teardown(id, Teardown::Close);
        }
    }

    /// The transport reported a fatal error; the connection is already gone.
    pub fn transport_error(&mut self, id: SessionId, err: std::io::Error) {
        if self.pool.get(id).is_none() {
            return;
        }
        tracing::error!(session = %id, error = %err, "transport error");
        self.stats.transport_errors += 1;
        self.stats.record_error(&WsError::Io(err));
        self.teardown(id, Teardown::Gone);
    }

    /// Periodic transport tick for `id`.
    ///
    /// Aborts the connection once `socket_timeout` ticks pass without a send
    /// completion (a zero timeout disables this).
    pub fn transport_poll(&mut self, id: SessionId) {
        let limit = self.config.socket_timeout;
        let Some(session) = self.pool.get_mut(id) else {
            return;
        };
        session.timeout = session.timeout.saturating_add(1);
        if limit != 0 && session.timeout > limit {
            tracing::warn!(session = %id, ticks = session.timeout, "socket timeout");
            self.stats.timeouts += 1;
            self.teardown(id, Teardown::Abort);
        }
    }

    /// The transport finished sending `len` bytes for `id`.
    pub fn sent(&mut self, id: SessionId, _len: usize) {
        if let Some(session) = self.pool.get_mut(id) {
            session.timeout = 0;
        }
    }

    /// Accumulate upgrade request bytes and answer once complete.
    fn handshake(&mut self, id: SessionId, data: Bytes) -> Result<()> {
        let Some(session) = self.pool.get_mut(id) else {
            return Err(WsError::InvalidSession);
        };
        let Receiver::Handshake(request) = &mut session.receiver else {
            return Err(WsError::NotConnected);
        };

        let pushed = request.push(&data);
        let leftover = match pushed {
            Ok(Some(head_len)) => Bytes::copy_from_slice(&request.as_bytes()[head_len..]),
            _ => Bytes::new(),
        };
        // Leftover frame bytes are acknowledged once decoded.
        if let Some(conn) = session.conn.as_mut() {
            conn.recved(data.len() - leftover.len());
        }

        let head_len = match pushed {
            Ok(Some(head_len)) => head_len,
            Ok(None) => return Ok(()),
            Err(err) => return Err(self.refuse_handshake(id, err)),
        };

        let parsed = UpgradeRequest::parse(&request.as_bytes()[..head_len]);
        let upgrade = match parsed {
            Ok(upgrade) => upgrade,
            Err(err) => return Err(self.refuse_handshake(id, err)),
        };

        let mut is_binary = false;
        let protocol = match upgrade.offered_protocols() {
            Some(offered) => self.events.on_protocol_select(id, offered, &mut is_binary),
            None => None,
        };
        let response = response_101(&upgrade.accept_key(), protocol.as_deref());

        let now = self.clock.now();
        let Some(session) = self.pool.get_mut(id) else {
            return Err(WsError::InvalidSession);
        };
        let written = match session.conn.as_mut() {
            Some(conn) => conn.write(&response),
            None => Err(crate::transport::WriteError::Closed),
        };
        if let Err(err) = written {
            tracing::error!(session = %id, error = %err, "upgrade response not written");
            self.teardown(id, Teardown::Abort);
            return Err(err.into());
        }

        session.state = SessionState::Connected;
        session.frame_start = FrameStart::data(is_binary);
        session.protocol = protocol;
        session.last_send = now;
        session.start_frames();
        session.pending.push(leftover);
        self.events.on_client_connect(id, &mut session.handlers);

        tracing::info!(
            session = %id,
            protocol = session.protocol.as_deref().unwrap_or("-"),
            binary = is_binary,
            "session connected"
        );

        if self.config.auto_claim && self.stream.owner().is_none() {
            self.claim_stream(id)?;
        }
        self.process_input(id);
        Ok(())
    }

    /// Answer a failed upgrade with 400 or 500 and free the slot.
    fn refuse_handshake(&mut self, id: SessionId, err: WsError) -> WsError {
        let status = match err {
            WsError::OutOfMemory(_) => HTTP_500,
            _ => HTTP_400,
        };
        tracing::warn!(session = %id, error = %err, "upgrade refused");
        self.stats.handshake_failures += 1;
        self.stats.record_error(&err);

        if let Some(conn) = self.pool.get_mut(id).and_then(|s| s.conn.as_mut()) {
            if write_all(conn, status).is_err() {
                tracing::debug!(session = %id, "error response not fully written");
            }
        }
        self.teardown(id, Teardown::Close);
        err
    }
}
