//! End-to-end test of the tokio front-end with a raw TCP client.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use websocketd::handler::{FrameContext, FrameHandlers};
use websocketd::transport::tcp::TcpServer;
use websocketd::{MessageKind, ServerBuilder, ServerEvents, SessionId};

const REQUEST: &str = "GET / HTTP/1.1\r\n\
    Host: localhost\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

/// Answers every text message with its upper-case form.
struct Upper;

impl ServerEvents for Upper {
    fn on_client_connect(&mut self, _session: SessionId, handlers: &mut FrameHandlers) {
        handlers.register(
            MessageKind::Text,
            Box::new(|ctx: &mut FrameContext, msg: &[u8]| {
                ctx.reply_text(&String::from_utf8_lossy(msg).to_uppercase());
            }),
        );
    }
}

fn client_frame(first: u8, payload: &[u8]) -> Vec<u8> {
    let mask = [1u8, 2, 3, 4];
    let mut out = vec![first, 0x80 | payload.len() as u8];
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    out
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_upgrade_echo_and_close_over_tcp() {
    let server = ServerBuilder::new().events(Upper).build().unwrap();
    let mut tcp = TcpServer::bind_addr(server, "127.0.0.1:0")
        .await
        .unwrap()
        .tick(Duration::from_millis(20));
    let addr = tcp.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(REQUEST.as_bytes()).await.unwrap();

            let head = read_head(&mut stream).await;
            assert!(head.starts_with("HTTP/1.1 101"));
            assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

            stream.write_all(&client_frame(0x81, b"hello")).await.unwrap();
            let mut reply = [0u8; 7];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"\x81\x05HELLO");

            stream.write_all(&client_frame(0x88, &[0x03, 0xe8])).await.unwrap();
            let mut close = [0u8; 4];
            stream.read_exact(&mut close).await.unwrap();
            assert_eq!(close, [0x88, 0x02, 0x03, 0xe8]);

            // Torn down on the next tick.
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        };
        tokio::time::timeout(Duration::from_secs(5), exchange)
            .await
            .expect("client timed out");
    });

    let mut outcome = None;
    tcp.run_until(async { outcome = Some(client.await) }).await;
    outcome.unwrap().unwrap();

    let stats = tcp.server().stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.closed, 1);
    assert!(tcp.server().is_stopped());
}
