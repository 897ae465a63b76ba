//! Handler module - out-of-band message delivery.
//!
//! Provides:
//! - [`FrameHandlers`] - per-session text/binary handler slots
//! - [`FrameContext`] - lets handlers queue replies or close the session
//!
//! # Example
//!
//! ```
//! use websocketd::handler::{FrameContext, FrameHandlers};
//! use websocketd::protocol::MessageKind;
//! use websocketd::SessionId;
//!
//! let mut handlers = FrameHandlers::new();
//! handlers.register(MessageKind::Text, Box::new(|ctx: &mut FrameContext, msg: &[u8]| {
//!     ctx.reply(msg);
//! }));
//!
//! let mut ctx = FrameContext::new(SessionId::new(0, 1), MessageKind::Text);
//! handlers.dispatch(MessageKind::Text, &mut ctx, b"ping");
//! assert_eq!(&ctx.replies()[0].payload[..], b"ping");
//! ```

mod context;
mod registry;

pub use context::{FrameContext, Reply};
pub use registry::{FrameHandler, FrameHandlers};
