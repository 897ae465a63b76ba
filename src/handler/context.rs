//! Context passed to frame handlers.
//!
//! Handlers run while the server is processing input, so they cannot write
//! to the connection directly. Replies are collected here and sent as
//! frames right after the handler returns.
//!
//! # Example
//!
//! ```
//! use websocketd::handler::FrameContext;
//! use websocketd::protocol::MessageKind;
//! use websocketd::SessionId;
//!
//! let mut ctx = FrameContext::new(SessionId::new(0, 1), MessageKind::Text);
//! ctx.reply(b"echo");
//! ctx.reply_json(&serde_json::json!({ "state": "Idle" })).unwrap();
//!
//! assert_eq!(ctx.replies().len(), 2);
//! ```

use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;
use crate::protocol::{FrameStart, MessageKind};
use crate::session::SessionId;

/// A frame queued by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Frame token (text or binary).
    pub start: FrameStart,
    /// Payload.
    pub payload: Bytes,
}

/// Context for one delivered message.
#[derive(Debug)]
pub struct FrameContext {
    session: SessionId,
    kind: MessageKind,
    replies: Vec<Reply>,
    close: bool,
}

impl FrameContext {
    /// Create a context for a message of `kind` from `session`.
    pub fn new(session: SessionId, kind: MessageKind) -> Self {
        Self {
            session,
            kind,
            replies: Vec::new(),
            close: false,
        }
    }

    /// Session the message came from.
    #[inline]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Kind of the delivered message.
    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Reply with the same kind as the delivered message.
    pub fn reply(&mut self, payload: &[u8]) {
        self.push(FrameStart::data(self.kind.is_binary()), Bytes::copy_from_slice(payload));
    }

    /// Reply with a text frame.
    pub fn reply_text(&mut self, text: &str) {
        self.push(FrameStart::TEXT, Bytes::copy_from_slice(text.as_bytes()));
    }

    /// Reply with a binary frame.
    pub fn reply_binary(&mut self, payload: impl Into<Bytes>) {
        self.push(FrameStart::BINARY, payload.into());
    }

    /// Serialize `value` to JSON and reply with a text frame.
    pub fn reply_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        self.push(FrameStart::TEXT, Bytes::from(json));
        Ok(())
    }

    /// Ask the server to close this session after the replies are sent.
    pub fn close(&mut self) {
        self.close = true;
    }

    /// `true` if [`close`](Self::close) was called.
    #[inline]
    pub fn close_requested(&self) -> bool {
        self.close
    }

    /// Queued replies.
    #[inline]
    pub fn replies(&self) -> &[Reply] {
        &self.replies
    }

    /// Take the queued replies.
    pub fn into_replies(self) -> Vec<Reply> {
        self.replies
    }

    fn push(&mut self, start: FrameStart, payload: Bytes) {
        self.replies.push(Reply { start, payload });
    }
}
