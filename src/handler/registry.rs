//! Per-session out-of-band frame handlers.
//!
//! A session may register one handler for text and one for binary messages.
//! A registered handler takes precedence over the shared stream for its
//! message kind.

use std::fmt;

use super::FrameContext;
use crate::protocol::MessageKind;

/// Callback receiving a complete message.
pub type FrameHandler = Box<dyn FnMut(&mut FrameContext, &[u8])>;

/// Text and binary handler slots of one session.
#[derive(Default)]
pub struct FrameHandlers {
    text: Option<FrameHandler>,
    binary: Option<FrameHandler>,
}

impl FrameHandlers {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, kind: MessageKind) -> &mut Option<FrameHandler> {
        match kind {
            MessageKind::Text => &mut self.text,
            MessageKind::Binary => &mut self.binary,
        }
    }

    /// Install a handler, returning the one it replaces.
    pub fn register(&mut self, kind: MessageKind, handler: FrameHandler) -> Option<FrameHandler> {
        self.slot(kind).replace(handler)
    }

    /// Remove a handler.
    pub fn unregister(&mut self, kind: MessageKind) -> Option<FrameHandler> {
        self.slot(kind).take()
    }

    /// `true` if a handler is installed for `kind`.
    #[inline]
    pub fn has(&self, kind: MessageKind) -> bool {
        match kind {
            MessageKind::Text => self.text.is_some(),
            MessageKind::Binary => self.binary.is_some(),
        }
    }

    /// Call the handler for `kind`, if any. Returns `false` when none is set.
    pub fn dispatch(&mut self, kind: MessageKind, ctx: &mut FrameContext, message: &[u8]) -> bool {
        match self.slot(kind).as_mut() {
            Some(handler) => {
                handler(ctx, message);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for FrameHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandlers")
            .field("text", &self.text.is_some())
            .field("binary", &self.binary.is_some())
            .finish()
    }
}
