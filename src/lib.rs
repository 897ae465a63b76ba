//! # websocketd
//!
//! Cooperative, poll-driven WebSocket server that shares one console byte
//! stream between a small pool of clients.
//!
//! The core is sans-IO: the network layer hands it connections and received
//! segments, and it writes back through the [`transport::Connection`] trait.
//! Everything runs on one thread of control; nothing blocks, and work that
//! cannot finish (full RX ring, full send buffer) resumes on the next
//! callback or [`poll`](WebSocketServer::poll).
//!
//! ## Architecture
//!
//! - **Handshake**: HTTP/1.1 upgrade with `Sec-WebSocket-Accept` and sub-protocol
//!   selection (`arduino` switches the session to binary frames)
//! - **Frames**: incremental RFC 6455 decoder that resumes across segment
//!   boundaries and stream stalls
//! - **Stream**: RX/TX rings owned by at most one session at a time; other
//!   sessions can still exchange messages through per-session frame handlers
//! - **Liveness**: keepalive pings, socket timeouts and stale-session reclaim
//!   after a link loss
//!
//! ## Example
//!
//! ```ignore
//! use websocketd::transport::tcp::TcpServer;
//! use websocketd::{IoStream, ServerBuilder};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> websocketd::Result<()> {
//!     let server = ServerBuilder::new().port(81).build()?;
//!     let mut tcp = TcpServer::bind(server).await?;
//!
//!     // Echo console input back to the stream owner.
//!     tcp.run_with(tokio::signal::ctrl_c(), |server| {
//!         while let Some(byte) = server.stream_mut().read_char() {
//!             server.stream_mut().write_char(byte);
//!         }
//!     })
//!     .await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ServerConfig;
pub use error::{Result, WsError};
pub use handler::FrameContext;
pub use protocol::MessageKind;
pub use server::{DefaultEvents, ServerBuilder, ServerEvents, ServerStats, WebSocketServer};
pub use session::{SessionId, SessionState};
pub use stream::{IoStream, StreamArbiter, StreamEvent, StreamFlags};
