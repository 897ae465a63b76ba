//! Console echo - one browser tab owns the console, everyone else gets pings.
//!
//! This example demonstrates:
//! - Running the core over TCP with [`TcpServer`]
//! - Reading the shared stream and writing output back to its owner
//! - A per-session text handler answering `status` queries out of band
//!
//! # Trying it
//!
//! ```sh
//! cargo run --example echo
//! # in a browser console:
//! #   ws = new WebSocket("ws://localhost:8081/"); ws.onmessage = e => console.log(e.data)
//! #   ws.send("G0 X10\n")
//! ```

use std::time::Duration;

use websocketd::handler::{FrameContext, FrameHandlers};
use websocketd::transport::tcp::TcpServer;
use websocketd::{IoStream, MessageKind, ServerBuilder, ServerEvents, SessionId};

/// Installs a `status` handler on secondary sessions.
struct Events;

impl ServerEvents for Events {
    fn on_client_connect(&mut self, session: SessionId, handlers: &mut FrameHandlers) {
        if session.index() == 0 {
            return;
        }
        handlers.register(
            MessageKind::Text,
            Box::new(|ctx: &mut FrameContext, msg: &[u8]| {
                if msg == b"status" {
                    if let Err(err) = ctx.reply_json(&serde_json::json!({ "state": "Idle" })) {
                        tracing::warn!(error = %err, "status reply not queued");
                    }
                }
            }),
        );
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = ServerBuilder::new()
        .port(8081)
        .ping_interval(Duration::from_secs(3))
        .events(Events)
        .build()?;

    let mut tcp = TcpServer::bind(server).await?.tick(Duration::from_millis(20));

    // Echo each received line prefixed with "ok ".
    let mut line = Vec::new();
    tcp.run_with(tokio::signal::ctrl_c(), |server| {
        while let Some(byte) = server.stream_mut().read_char() {
            line.push(byte);
            if byte == b'\n' {
                let stream = server.stream_mut();
                stream.write_str("ok ");
                stream.write(&line);
                line.clear();
            }
        }
    })
    .await;

    Ok(())
}
