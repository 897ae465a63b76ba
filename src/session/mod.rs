//! Session module - per-client state and the bounded session table.

mod pool;
mod state;

pub use pool::{SessionId, SessionPool};
pub use state::{Session, SessionState};

pub(crate) use state::{MessageInbox, Receiver};
