//! Integration tests for websocketd.
//!
//! These drive the sans-IO core end to end with a recording connection and
//! a manual clock: upgrade, frame decoding, stream arbitration and liveness.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use websocketd::handler::FrameContext;
use websocketd::protocol::{close_code, Frame, Opcode};
use websocketd::transport::{Connection, WriteError};
use websocketd::{
    IoStream, ManualClock, MessageKind, ServerBuilder, ServerConfig, ServerEvents, SessionId,
    SessionState, StreamEvent, WebSocketServer, WsError,
};

const REQUEST: &str = "GET /ws HTTP/1.1\r\n\
    Host: cnc.local\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// What the server did to one connection.
#[derive(Debug)]
struct Wire {
    written: Vec<u8>,
    sndbuf: usize,
    recved: usize,
    closed: bool,
    aborted: bool,
}

#[derive(Debug, Clone)]
struct MockConn(Rc<RefCell<Wire>>);

impl MockConn {
    fn new() -> Self {
        Self(Rc::new(RefCell::new(Wire {
            written: Vec::new(),
            sndbuf: 4096,
            recved: 0,
            closed: false,
            aborted: false,
        })))
    }

    fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.borrow_mut().written)
    }

    /// Drain and decode everything written since the last call.
    fn take_frames(&self) -> Vec<Frame> {
        let bytes = self.take_written();
        let mut frames = Vec::new();
        let mut at = 0;
        while at < bytes.len() {
            let frame = Frame::parse(&bytes[at..]).expect("incomplete server frame");
            at += frame.encoded_len();
            frames.push(frame);
        }
        frames
    }

    fn closed(&self) -> bool {
        self.0.borrow().closed
    }

    fn aborted(&self) -> bool {
        self.0.borrow().aborted
    }
}

impl Connection for MockConn {
    fn write(&mut self, data: &[u8]) -> Result<(), WriteError> {
        let mut wire = self.0.borrow_mut();
        if wire.closed || wire.aborted {
            return Err(WriteError::Closed);
        }
        if data.len() > wire.sndbuf {
            return Err(WriteError::Full);
        }
        wire.written.extend_from_slice(data);
        Ok(())
    }

    fn send_buffer(&self) -> usize {
        self.0.borrow().sndbuf
    }

    fn recved(&mut self, len: usize) {
        self.0.borrow_mut().recved += len;
    }

    fn close(&mut self) -> Result<(), WriteError> {
        self.0.borrow_mut().closed = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.0.borrow_mut().aborted = true;
    }
}

/// Records server callbacks as strings.
#[derive(Debug, Clone, Default)]
struct Recorder(Rc<RefCell<Vec<String>>>);

impl Recorder {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

impl ServerEvents for Recorder {
    fn on_client_connect(&mut self, session: SessionId, _: &mut websocketd::handler::FrameHandlers) {
        self.0.borrow_mut().push(format!("connect {session}"));
    }

    fn on_client_disconnect(&mut self, session: SessionId) {
        self.0.borrow_mut().push(format!("disconnect {session}"));
    }

    fn on_stream_change(&mut self, event: StreamEvent) {
        let line = match event {
            StreamEvent::Connected { session, .. } => format!("claim {session}"),
            StreamEvent::Disconnected { session } => format!("release {session}"),
        };
        self.0.borrow_mut().push(line);
    }
}

/// Masked client frame.
fn client_frame(first: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![first];
    if payload.len() < 126 {
        out.push(0x80 | payload.len() as u8);
    } else {
        out.push(0x80 | 126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(&MASK);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ MASK[i % 4]));
    out
}

fn text(payload: &str) -> Vec<u8> {
    client_frame(0x81, payload.as_bytes())
}

fn server_with(config: ServerConfig) -> (WebSocketServer<MockConn>, ManualClock, Recorder) {
    let clock = ManualClock::new();
    let events = Recorder::default();
    let server = ServerBuilder::new()
        .config(config)
        .clock(clock.clone())
        .events(events.clone())
        .build()
        .unwrap();
    (server, clock, events)
}

fn server() -> (WebSocketServer<MockConn>, ManualClock, Recorder) {
    server_with(ServerConfig::default())
}

/// Accept and upgrade a client, discarding the 101 response.
fn connect(server: &mut WebSocketServer<MockConn>) -> (SessionId, MockConn) {
    let conn = MockConn::new();
    let id = server.accept(conn.clone()).unwrap();
    server.receive(id, REQUEST).unwrap();
    let response = conn.take_written();
    assert!(response.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
    (id, conn)
}

fn read_all(server: &mut WebSocketServer<MockConn>) -> Vec<u8> {
    std::iter::from_fn(|| server.stream_mut().read_char()).collect()
}

#[test]
fn test_handshake_accept_key() {
    let (mut server, _, events) = server();
    let conn = MockConn::new();
    let id = server.accept(conn.clone()).unwrap();
    assert_eq!(server.session_state(id), SessionState::Connecting);

    server.receive(id, REQUEST).unwrap();

    let response = String::from_utf8(conn.take_written()).unwrap();
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(!response.contains("Sec-WebSocket-Protocol"));
    assert!(response.ends_with("\r\n\r\n"));
    assert!(server.is_connected(id));
    assert_eq!(server.stream().owner(), Some(id));
    assert_eq!(events.take(), vec![format!("connect {id}"), format!("claim {id}")]);
}

#[test]
fn test_handshake_split_with_trailing_frame() {
    let (mut server, _, _) = server();
    let conn = MockConn::new();
    let id = server.accept(conn.clone()).unwrap();

    let (a, rest) = REQUEST.split_at(20);
    let (b, c) = rest.split_at(40);
    server.receive(id, a.to_string()).unwrap();
    server.receive(id, b.to_string()).unwrap();
    assert_eq!(server.session_state(id), SessionState::Connecting);

    let mut last = c.as_bytes().to_vec();
    last.extend(text("G0 X1\n"));
    server.receive(id, last).unwrap();

    assert!(server.is_connected(id));
    assert_eq!(read_all(&mut server), b"G0 X1\n");
}

#[test]
fn test_arduino_protocol_selects_binary_frames() {
    let (mut server, _, _) = server();
    let conn = MockConn::new();
    let id = server.accept(conn.clone()).unwrap();
    let request = REQUEST.replace(
        "Sec-WebSocket-Version: 13\r\n",
        "Sec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: arduino, text\r\n",
    );
    server.receive(id, request).unwrap();

    let response = String::from_utf8(conn.take_written()).unwrap();
    assert!(response.contains("Sec-WebSocket-Protocol: arduino\r\n"));
    assert_eq!(server.session(id).unwrap().protocol(), Some("arduino"));

    server.stream_mut().write_str("ok\r\n");
    server.poll();
    let frames = conn.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode(), Some(Opcode::Binary));
    assert_eq!(frames[0].payload(), b"ok\r\n");
}

#[test]
fn test_missing_key_answered_with_400() {
    let (mut server, _, events) = server();
    let conn = MockConn::new();
    let id = server.accept(conn.clone()).unwrap();

    let result = server.receive(id, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");

    assert!(matches!(result, Err(WsError::MissingKey)));
    assert!(conn.take_written().starts_with(b"HTTP/1.1 400"));
    assert!(conn.closed());
    assert_eq!(server.session_state(id), SessionState::Free);
    assert_eq!(server.stats().handshake_failures, 1);
    assert!(events.take().is_empty());
}

#[test]
fn test_oversized_request_refused() {
    let (mut server, _, _) = server();
    let conn = MockConn::new();
    let id = server.accept(conn.clone()).unwrap();

    let filler = format!("GET / HTTP/1.1\r\nX-Pad: {}", "a".repeat(1100));
    let result = server.receive(id, filler);

    assert!(matches!(result, Err(WsError::RequestTooLarge(1024))));
    assert!(conn.take_written().starts_with(b"HTTP/1.1 400"));
    assert_eq!(server.session_state(id), SessionState::Free);
}

#[test]
fn test_text_into_stream_and_output_framed() {
    let (mut server, _, _) = server();
    let (id, conn) = connect(&mut server);

    server.receive(id, text("$$\n")).unwrap();
    assert_eq!(read_all(&mut server), b"$$\n");
    assert_eq!(conn.0.borrow().recved, REQUEST.len() + 6 + 3);

    server.stream_mut().write_str("ok\r\n");
    server.poll();

    let frames = conn.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode(), Some(Opcode::Text));
    assert_eq!(frames[0].payload(), b"ok\r\n");
    assert_eq!(server.stream().tx_count(), 0);
}

#[test]
fn test_output_waits_for_send_buffer() {
    let (mut server, _, _) = server();
    let (_, conn) = connect(&mut server);

    server.stream_mut().write_str("0123456789");
    conn.0.borrow_mut().sndbuf = 8;
    server.poll();

    // Four bytes of the send buffer are kept for the header.
    let frames = conn.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload(), b"0123");
    assert_eq!(server.stream().tx_count(), 6);

    conn.0.borrow_mut().sndbuf = 4096;
    server.poll();
    assert_eq!(conn.take_frames()[0].payload(), b"456789");
}

#[test]
fn test_fragmented_message_with_ping_between() {
    let (mut server, _, _) = server();
    let (id, conn) = connect(&mut server);

    let mut input = client_frame(0x01, b"ab");
    input.extend(client_frame(0x89, b"p"));
    input.extend(client_frame(0x80, b"cd"));

    // Deliver one byte at a time.
    for byte in input {
        server.receive(id, vec![byte]).unwrap();
    }

    assert_eq!(read_all(&mut server), b"abcd");
    let frames = conn.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode(), Some(Opcode::Pong));
    assert_eq!(frames[0].payload(), b"p");
}

#[test]
fn test_close_echoed_then_torn_down() {
    let (mut server, _, events) = server();
    let (id, conn) = connect(&mut server);
    events.take();

    server
        .receive(id, client_frame(0x88, &[0x03, 0xe8, b'b', b'y', b'e']))
        .unwrap();

    let frames = conn.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode(), Some(Opcode::Close));
    assert_eq!(frames[0].close_code(), Some(close_code::NORMAL));
    assert_eq!(&frames[0].payload()[2..], b"bye");
    assert_eq!(server.session_state(id), SessionState::Closing);
    assert_eq!(server.stream().owner(), None);
    assert_eq!(events.take(), vec![format!("release {id}")]);

    server.poll();
    assert_eq!(server.session_state(id), SessionState::Free);
    assert!(conn.closed());
    assert_eq!(events.take(), vec![format!("disconnect {id}")]);
    assert_eq!(server.stats().closed, 1);
}

#[test]
fn test_closing_owner_frees_stream_for_another_session() {
    let (mut server, _, events) = server();
    let (owner, owner_conn) = connect(&mut server);
    let (other, other_conn) = connect(&mut server);
    events.take();

    server
        .receive(owner, client_frame(0x88, &[0x03, 0xe8, b'b', b'y', b'e']))
        .unwrap();
    assert_eq!(server.session_state(owner), SessionState::Closing);

    assert_eq!(server.stream().owner(), None);
    assert!(!server.stream().state().connected);
    assert_eq!(server.stream_mut().write_str("late output"), 0);
    assert!(matches!(server.claim_stream(owner), Err(WsError::NotConnected)));
    assert!(server.claim_stream(other).unwrap());
    assert_eq!(events.take(), vec![format!("release {owner}"), format!("claim {other}")]);

    server.stream_mut().write_str("hi");
    server.poll();
    assert_eq!(server.session_state(owner), SessionState::Free);
    assert!(owner_conn.closed());
    assert_eq!(server.stream().owner(), Some(other));
    assert_eq!(other_conn.take_frames()[0].payload(), b"hi");
}

#[test]
fn test_keepalive_gives_up_after_missed_pings() {
    let (mut server, clock, _) = server();
    let (id, conn) = connect(&mut server);

    server.poll();
    assert!(conn.take_frames().is_empty());

    for expected in 1..=4u8 {
        clock.advance(Duration::from_millis(3001));
        server.poll();
        let frames = conn.take_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode(), Some(Opcode::Ping));
        assert_eq!(frames[0].payload(), b"Hi");
        assert_eq!(server.session(id).unwrap().ping_count(), expected);
    }

    server.poll();
    assert_eq!(server.session_state(id), SessionState::Closing);
    assert_eq!(server.stream().owner(), None);
    server.poll();
    assert_eq!(server.session_state(id), SessionState::Free);
}

#[test]
fn test_pong_resets_ping_count() {
    let (mut server, clock, _) = server();
    let (id, conn) = connect(&mut server);

    for _ in 0..2 {
        clock.advance(Duration::from_millis(3001));
        server.poll();
    }
    assert_eq!(conn.take_frames().len(), 2);
    assert_eq!(server.session(id).unwrap().ping_count(), 2);

    server.receive(id, client_frame(0x8a, b"Hi")).unwrap();
    assert_eq!(server.session(id).unwrap().ping_count(), 0);
}

#[test]
fn test_pool_full_refuses_connection() {
    let config = ServerConfig {
        max_sessions: 2,
        ..ServerConfig::default()
    };
    let (mut server, _, _) = server_with(config);
    connect(&mut server);
    connect(&mut server);

    let extra = MockConn::new();
    let result = server.accept(extra.clone());

    assert!(matches!(result, Err(WsError::PoolExhausted(2))));
    assert!(extra.aborted());
    assert_eq!(server.stats().refused, 1);
    assert_eq!(server.stats().accepted, 2);
}

#[test]
fn test_link_loss_reclaims_oldest_session() {
    let config = ServerConfig {
        max_sessions: 2,
        ..ServerConfig::default()
    };
    let (mut server, _, _) = server_with(config);
    let (first, first_conn) = connect(&mut server);
    let (second, second_conn) = connect(&mut server);

    server.notify_link_status(false);
    let id = server.accept(MockConn::new()).unwrap();

    assert!(first_conn.aborted());
    assert!(!second_conn.aborted());
    assert_eq!(server.session_state(first), SessionState::Free);
    assert!(server.is_connected(second));
    assert_eq!(id.index(), first.index());
    assert_ne!(id, first);
    assert_eq!(server.stats().reclaimed, 1);
    assert_eq!(server.stream().owner(), None);
}

#[test]
fn test_stream_claim_is_exclusive() {
    let (mut server, _, _) = server();
    let (owner, owner_conn) = connect(&mut server);
    let (other, other_conn) = connect(&mut server);

    assert!(matches!(server.claim_stream(other), Err(WsError::StreamBusy)));

    server.receive(other, text("ignored")).unwrap();
    assert_eq!(server.stream().rx_count(), 0);

    server.stream_mut().write_str("x");
    server.poll();
    assert_eq!(owner_conn.take_frames().len(), 1);
    assert!(other_conn.take_frames().is_empty());

    assert!(server.release_stream(owner));
    assert!(server.claim_stream(other).unwrap());
    server.receive(other, text("mine")).unwrap();
    assert_eq!(read_all(&mut server), b"mine");
}

#[test]
fn test_frame_handler_takes_precedence() {
    let (mut server, _, _) = server();
    let (id, conn) = connect(&mut server);

    let previous = server
        .register_frame_handler(id, MessageKind::Text, |ctx: &mut FrameContext, msg: &[u8]| {
            ctx.reply_text(&String::from_utf8_lossy(msg).to_uppercase());
        })
        .unwrap();
    assert!(previous.is_none());

    server.receive(id, text("status")).unwrap();
    assert_eq!(server.stream().rx_count(), 0);
    let frames = conn.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload(), b"STATUS");

    server.receive(id, client_frame(0x82, b"raw")).unwrap();
    assert_eq!(read_all(&mut server), b"raw");
}

#[test]
fn test_handler_sees_whole_fragmented_message() {
    let (mut server, _, _) = server();
    let (id, conn) = connect(&mut server);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    server
        .register_frame_handler(id, MessageKind::Binary, move |ctx: &mut FrameContext, msg: &[u8]| {
            sink.borrow_mut().push(msg.to_vec());
            ctx.close();
        })
        .unwrap();

    let mut input = client_frame(0x02, b"he");
    input.extend(client_frame(0x00, b"ll"));
    input.extend(client_frame(0x80, b"o"));
    server.receive(id, input).unwrap();

    assert_eq!(*seen.borrow(), vec![b"hello".to_vec()]);
    let frames = conn.take_frames();
    assert_eq!(frames[0].close_code(), Some(close_code::NORMAL));
    assert_eq!(server.session_state(id), SessionState::Closing);
}

#[test]
fn test_socket_timeout_aborts() {
    let config = ServerConfig {
        socket_timeout: 2,
        ..ServerConfig::default()
    };
    let (mut server, _, _) = server_with(config);
    let (id, conn) = connect(&mut server);

    server.transport_poll(id);
    server.transport_poll(id);
    server.sent(id, 10);
    server.transport_poll(id);
    server.transport_poll(id);
    assert!(server.is_connected(id));

    server.transport_poll(id);
    assert!(conn.aborted());
    assert_eq!(server.session_state(id), SessionState::Free);
    assert_eq!(server.stats().timeouts, 1);
}

#[test]
fn test_full_rx_ring_stalls_and_resumes() {
    let config = ServerConfig {
        rx_buffer_size: 8,
        ..ServerConfig::default()
    };
    let (mut server, _, _) = server_with(config);
    let (id, _) = connect(&mut server);

    server.receive(id, text("0123456789")).unwrap();
    assert_eq!(server.stream().rx_count(), 7);
    assert_eq!(server.session(id).unwrap().pending_len(), 3);

    let mut received = Vec::new();
    for _ in 0..3 {
        received.extend(server.stream_mut().read_char());
    }
    server.poll();
    assert_eq!(server.session(id).unwrap().pending_len(), 0);

    received.extend(read_all(&mut server));
    assert_eq!(received, b"0123456789");
}

#[test]
fn test_pending_input_bounded_while_ring_stalled() {
    let config = ServerConfig {
        rx_buffer_size: 16,
        max_pending: 1024,
        ..ServerConfig::default()
    };
    let (mut server, _, _) = server_with(config);
    let (id, conn) = connect(&mut server);
    let frame = text(&"x".repeat(100));

    let mut refused = 0;
    for _ in 0..10_000 {
        match server.receive(id, frame.clone()) {
            Ok(()) => {}
            Err(WsError::WindowFull(queued)) => {
                assert!(queued <= 1024);
                refused += 1;
            }
            Err(err) => panic!("unexpected receive error: {err}"),
        }
        server.poll();
        assert!(server.session(id).unwrap().pending_len() <= 1024);
    }
    assert!(refused > 9_000);
    assert!(server.is_connected(id));

    // Accepted input is either acknowledged or still queued.
    let accepted = 10_000 - refused;
    let acked = conn.0.borrow().recved - REQUEST.len();
    assert_eq!(
        acked + server.session(id).unwrap().pending_len(),
        accepted * frame.len()
    );

    // Draining the console reopens the window.
    let mut received = Vec::new();
    for _ in 0..1_000 {
        received.extend(read_all(&mut server));
        server.poll();
        if server.session(id).unwrap().pending_len() == 0 {
            break;
        }
    }
    received.extend(read_all(&mut server));
    assert_eq!(server.session(id).unwrap().pending_len(), 0);
    assert_eq!(received.len(), accepted * 100);
    server.receive(id, frame).unwrap();
}

#[test]
fn test_realtime_handler_sees_bytes_first() {
    let taken = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&taken);
    let mut server: WebSocketServer<MockConn> = ServerBuilder::new()
        .realtime_handler(move |byte| {
            if byte == b'?' || byte == b'!' {
                sink.borrow_mut().push(byte);
                true
            } else {
                false
            }
        })
        .build()
        .unwrap();
    let (id, _) = connect(&mut server);

    server.receive(id, text("G1?X!")).unwrap();

    assert_eq!(*taken.borrow(), b"?!");
    assert_eq!(read_all(&mut server), b"G1X");
}

#[test]
fn test_64bit_length_closes_with_1009() {
    let (mut server, _, _) = server();
    let (id, conn) = connect(&mut server);

    let mut frame = vec![0x82, 0x80 | 127];
    frame.extend_from_slice(&70_000u64.to_be_bytes());
    frame.extend_from_slice(&MASK);
    server.receive(id, frame).unwrap();

    let frames = conn.take_frames();
    assert_eq!(frames[0].close_code(), Some(close_code::TOO_BIG));
    assert_eq!(server.session_state(id), SessionState::Closing);
    assert_eq!(server.stream().owner(), None);
    assert_eq!(server.stats().protocol_errors, 1);
    // Discarded input is still acknowledged.
    assert_eq!(conn.0.borrow().recved, REQUEST.len() + 14);
}

#[test]
fn test_oversized_control_frame_closes_with_1002() {
    let (mut server, _, _) = server();
    let (id, conn) = connect(&mut server);

    server.receive(id, client_frame(0x89, &[0u8; 126])).unwrap();

    let frames = conn.take_frames();
    assert_eq!(frames[0].close_code(), Some(close_code::PROTOCOL_ERROR));
    assert_eq!(server.session_state(id), SessionState::Closing);
}

#[test]
fn test_send_and_broadcast() {
    let (mut server, _, _) = server();
    let (a, a_conn) = connect(&mut server);
    let (_, b_conn) = connect(&mut server);

    server.send_frame(a, b"{\"state\":\"Idle\"}", false).unwrap();
    assert_eq!(a_conn.take_frames()[0].payload(), b"{\"state\":\"Idle\"}");

    assert_eq!(server.broadcast_frame(&[1, 2, 3], true).unwrap(), 2);
    assert_eq!(b_conn.take_frames()[0].opcode(), Some(Opcode::Binary));

    let result = server.send_frame(a, &vec![0u8; 65_536], true);
    assert!(matches!(result, Err(WsError::FrameTooLarge(65_536))));
}

#[test]
fn test_stop_aborts_everything() {
    let (mut server, _, events) = server();
    let (id, conn) = connect(&mut server);
    events.take();

    server.stop();

    assert!(conn.aborted());
    assert_eq!(server.session_state(id), SessionState::Free);
    assert!(server.is_stopped());
    assert_eq!(events.take(), vec![format!("release {id}"), format!("disconnect {id}")]);

    let late = MockConn::new();
    assert!(matches!(server.accept(late.clone()), Err(WsError::Stopped)));
    assert!(late.aborted());
}

#[test]
fn test_close_connections_keeps_server_running() {
    let (mut server, _, _) = server();
    let (a, a_conn) = connect(&mut server);
    let (b, b_conn) = connect(&mut server);

    server.close_connections();

    assert!(a_conn.closed() && b_conn.closed());
    assert_eq!(server.session_state(a), SessionState::Free);
    assert_eq!(server.session_state(b), SessionState::Free);
    assert_eq!(server.stream().owner(), None);
    assert!(!server.is_stopped());
    connect(&mut server);
}
