//! Tokio TCP front-end.
//!
//! Runs the sans-IO core on real sockets. Each accepted socket is split into
//! a reader task and a writer task; both report back over one event channel
//! that the accept loop drains on the thread owning the
//! [`WebSocketServer`].
//!
//! ```text
//! reader task ─┐                         ┌─► receive / receive_closed / transport_error
//! writer task ─┼─► mpsc<NetEvent> ─► run ┼─► sent
//! listener    ─┘                         └─► poll + transport_poll (every tick)
//! ```
//!
//! Writes from the core are queued to the writer task and accounted against
//! a fixed per-connection send buffer and segment queue, so
//! [`Connection::send_buffer`], [`Connection::send_queue_full`] and
//! [`WriteError::Full`] behave like a real TCP send window.
//!
//! Reads are flow controlled the same way: the reader task only reads what
//! the core has room for (`max_pending`) and waits for
//! [`Connection::recved`] to reopen the window. A client that keeps sending
//! while the console is not read is held back by TCP itself.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Notify};

use super::{Connection, WriteError};
use crate::error::{Result, WsError};
use crate::server::WebSocketServer;
use crate::session::SessionId;

/// Default per-connection send buffer, in bytes.
pub const DEFAULT_SEND_BUFFER: usize = 8192;

/// Default number of writes that may wait for the writer task.
pub const DEFAULT_SEND_QUEUE: usize = 16;

/// Default interval between poll ticks.
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

/// Event channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Read chunk size.
const READ_CHUNK: usize = 1460;

/// Notification from a connection task.
#[derive(Debug)]
enum NetEvent {
    Data(SessionId, Bytes),
    Eof(SessionId),
    Failed(SessionId, io::Error),
    Sent(SessionId, usize),
}

enum Outbound {
    Data(Bytes),
    Close,
}

/// State shared between a [`TcpConnection`] and its tasks.
#[derive(Default)]
struct Shared {
    /// Bytes queued but not yet written to the socket.
    pending: AtomicUsize,
    /// Writes queued but not yet written to the socket.
    queued: AtomicUsize,
    /// Bytes read but not yet acknowledged by the core.
    unacked: AtomicUsize,
    aborted: AtomicBool,
    stop_reading: Notify,
    credit: Notify,
}

impl Shared {
    /// Return `len` bytes of receive window.
    fn ack(&self, len: usize) {
        if len == 0 {
            return;
        }
        // The closure never declines, so the update cannot fail.
        let _ = self
            .unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(len))
            });
        self.credit.notify_one();
    }
}

/// Connection handle held by the core for one accepted socket.
pub struct TcpConnection {
    tx: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
    limit: usize,
    queue_limit: usize,
    closing: bool,
    peer: SocketAddr,
}

impl TcpConnection {
    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Bytes queued for the socket.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Received bytes the core has not acknowledged yet.
    pub fn unacked(&self) -> usize {
        self.shared.unacked.load(Ordering::Acquire)
    }
}

impl Connection for TcpConnection {
    fn write(&mut self, data: &[u8]) -> std::result::Result<(), WriteError> {
        if self.closing {
            return Err(WriteError::Closed);
        }
        if data.len() > self.send_buffer() || self.send_queue_full() {
            return Err(WriteError::Full);
        }

        self.shared.pending.fetch_add(data.len(), Ordering::AcqRel);
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        self.tx
            .send(Outbound::Data(Bytes::copy_from_slice(data)))
            .map_err(|_| {
                self.shared.pending.fetch_sub(data.len(), Ordering::Release);
                self.shared.queued.fetch_sub(1, Ordering::Release);
                WriteError::Closed
            })
    }

    fn send_buffer(&self) -> usize {
        self.limit.saturating_sub(self.pending())
    }

    fn send_queue_full(&self) -> bool {
        self.shared.queued.load(Ordering::Acquire) >= self.queue_limit
    }

    fn recved(&mut self, len: usize) {
        self.shared.ack(len);
    }

    fn close(&mut self) -> std::result::Result<(), WriteError> {
        if self.closing {
            return Ok(());
        }
        self.closing = true;
        self.tx.send(Outbound::Close).map_err(|_| WriteError::Closed)
    }

    fn abort(&mut self) {
        self.closing = true;
        self.shared.aborted.store(true, Ordering::Release);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.shared.stop_reading.notify_one();
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .field("pending", &self.pending())
            .field("closing", &self.closing)
            .finish()
    }
}

/// Accept loop driving a [`WebSocketServer`] over TCP.
///
/// # Example
///
/// ```ignore
/// use websocketd::transport::tcp::TcpServer;
/// use websocketd::ServerBuilder;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> websocketd::Result<()> {
///     let server = ServerBuilder::new().port(8081).build()?;
///     let mut tcp = TcpServer::bind(server).await?;
///     tcp.run_until(tokio::signal::ctrl_c()).await;
///     Ok(())
/// }
/// ```
pub struct TcpServer {
    server: WebSocketServer<TcpConnection>,
    listener: TcpListener,
    events_tx: mpsc::Sender<NetEvent>,
    events_rx: mpsc::Receiver<NetEvent>,
    tick: Duration,
    send_buffer: usize,
    send_queue: usize,
}

impl TcpServer {
    /// Listen on all interfaces at the configured port.
    pub async fn bind(server: WebSocketServer<TcpConnection>) -> Result<Self> {
        let port = server.config().port;
        Self::bind_addr(server, (Ipv4Addr::UNSPECIFIED, port)).await
    }

    /// Listen on `addr`, ignoring the configured port.
    pub async fn bind_addr(
        server: WebSocketServer<TcpConnection>,
        addr: impl ToSocketAddrs,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "websocket server listening");

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            server,
            listener,
            events_tx,
            events_rx,
            tick: DEFAULT_TICK,
            send_buffer: DEFAULT_SEND_BUFFER,
            send_queue: DEFAULT_SEND_QUEUE,
        })
    }

    /// Set the poll tick interval.
    ///
    /// Default: 500 ms
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the per-connection send buffer.
    ///
    /// Default: 8192 bytes
    pub fn send_buffer(mut self, bytes: usize) -> Self {
        self.send_buffer = bytes;
        self
    }

    /// Set how many writes may wait for the socket.
    ///
    /// Default: 16
    pub fn send_queue(mut self, writes: usize) -> Self {
        self.send_queue = writes.max(1);
        self
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The core.
    pub fn server(&self) -> &WebSocketServer<TcpConnection> {
        &self.server
    }

    /// The core, mutably.
    pub fn server_mut(&mut self) -> &mut WebSocketServer<TcpConnection> {
        &mut self.server
    }

    /// Serve until `shutdown` completes, then stop the core.
    pub async fn run_until<F: Future>(&mut self, shutdown: F) {
        self.run_with(shutdown, |_| {}).await;
    }

    /// Like [`run_until`](Self::run_until), calling `app` on every tick
    /// before the core is polled. This is where the application reads the
    /// shared stream and writes its output.
    pub async fn run_with<F, A>(&mut self, shutdown: F, mut app: A)
    where
        F: Future,
        A: FnMut(&mut WebSocketServer<TcpConnection>),
    {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer),
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                },
                Some(event) = self.events_rx.recv() => self.on_event(event),
                _ = ticker.tick() => {
                    app(&mut self.server);
                    self.on_tick();
                }
            }
        }

        self.server.stop();
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, "set_nodelay failed");
        }
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let conn = TcpConnection {
            tx,
            shared: Arc::clone(&shared),
            limit: self.send_buffer,
            queue_limit: self.send_queue,
            closing: false,
            peer,
        };
        let window = self.server.config().max_pending;

        match self.server.accept(conn) {
            Ok(id) => {
                tracing::debug!(session = %id, %peer, "tcp connection accepted");
                tokio::spawn(read_loop(
                    id,
                    reader,
                    window,
                    Arc::clone(&shared),
                    self.events_tx.clone(),
                ));
                tokio::spawn(write_loop(id, writer, rx, shared, self.events_tx.clone()));
            }
            Err(err) => tracing::debug!(%peer, error = %err, "tcp connection dropped"),
        }
    }

    fn on_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Data(id, data) => match self.server.receive(id, data) {
                Ok(()) => {}
                Err(err @ WsError::WindowFull(_)) => {
                    tracing::warn!(session = %id, error = %err, "segment outside receive window dropped");
                }
                Err(err) => tracing::debug!(session = %id, error = %err, "receive failed"),
            },
            NetEvent::Eof(id) => self.server.receive_closed(id),
            NetEvent::Failed(id, err) => self.server.transport_error(id, err),
            NetEvent::Sent(id, len) => self.server.sent(id, len),
        }
    }

    fn on_tick(&mut self) {
        for id in self.server.sessions() {
            self.server.transport_poll(id);
        }
        self.server.poll();
    }
}

async fn read_loop(
    id: SessionId,
    mut reader: OwnedReadHalf,
    window: usize,
    shared: Arc<Shared>,
    events: mpsc::Sender<NetEvent>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        let room = loop {
            let unacked = shared.unacked.load(Ordering::Acquire);
            if unacked < window {
                break window - unacked;
            }
            tracing::trace!(session = %id, unacked, "receive window closed");
            tokio::select! {
                _ = shared.stop_reading.notified() => return,
                _ = shared.credit.notified() => {}
            }
        };

        buf.resize(room.min(READ_CHUNK), 0);
        tokio::select! {
            _ = shared.stop_reading.notified() => return,
            read = reader.read(&mut buf[..]) => {
                let event = match read {
                    Ok(0) => NetEvent::Eof(id),
                    Ok(n) => {
                        shared.unacked.fetch_add(n, Ordering::AcqRel);
                        buf.truncate(n);
                        NetEvent::Data(id, buf.split().freeze())
                    }
                    Err(err) => NetEvent::Failed(id, err),
                };
                let done = !matches!(event, NetEvent::Data(..));
                if events.send(event).await.is_err() || done {
                    return;
                }
            }
        }
    }
}

async fn write_loop(
    id: SessionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
    events: mpsc::Sender<NetEvent>,
) {
    while let Some(outbound) = rx.recv().await {
        if shared.aborted.load(Ordering::Acquire) {
            break;
        }
        match outbound {
            Outbound::Data(data) => {
                let len = data.len();
                let written = writer.write_all(&data).await;
                shared.pending.fetch_sub(len, Ordering::AcqRel);
                shared.queued.fetch_sub(1, Ordering::AcqRel);
                let event = match written {
                    Ok(()) => NetEvent::Sent(id, len),
                    Err(err) => NetEvent::Failed(id, err),
                };
                let failed = matches!(event, NetEvent::Failed(..));
                if events.send(event).await.is_err() || failed {
                    break;
                }
            }
            Outbound::Close => {
                if let Err(err) = writer.shutdown().await {
                    tracing::debug!(session = %id, error = %err, "shutdown failed");
                }
                break;
            }
        }
    }
    tracing::trace!(session = %id, "writer task finished");
}
