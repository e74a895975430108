use crate::buffer::{BufferPool, IoBuffer};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};
use trellis_common::error::TrellisError;
use trellis_common::TrellisResult;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection ids share one space whether or not a `Connection` wrapper is
/// involved (the HTTP/2 path hands the socket to the h2 handshake).
pub fn alloc_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Read buffers cycle through one process-wide freelist.
fn read_buffer_pool() -> &'static BufferPool {
    static POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}

/// Read buffer high-water mark; past it the read loop pauses until the
/// dispatcher drains.
pub const DEFAULT_BUFFER_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    ConnectTimeout,
    ConnectFailed,
    LocalClose,
    RemoteClose,
    OnReadErrClose,
    OnReadTimeout,
}

impl ConnectionEvent {
    pub fn is_close(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::LocalClose
                | ConnectionEvent::RemoteClose
                | ConnectionEvent::OnReadErrClose
        )
    }

    pub fn connect_failure(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::ConnectFailed | ConnectionEvent::ConnectTimeout
        )
    }
}

pub trait ConnectionEventListener: Send + Sync {
    fn on_event(&self, event: ConnectionEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    Stop,
}

/// Installed on a connection's read path; the proxy is one of these.
/// Returning `Stop` pauses reads until `set_read_disable(false)`.
#[async_trait]
pub trait ReadFilter: Send + Sync {
    async fn on_data(&self, buf: &mut IoBuffer) -> FilterStatus;
}

enum WriteCmd {
    Data(Bytes),
    Close,
}

/// One transport endpoint. Reads run on a dedicated task feeding the read
/// filter; writes are serialized through a queue drained by a writer task.
pub struct Connection {
    id: u64,
    remote_addr: Option<SocketAddr>,
    write_tx: mpsc::UnboundedSender<WriteCmd>,
    read_disable: watch::Sender<bool>,
    listeners: Mutex<Vec<Arc<dyn ConnectionEventListener>>>,
    closed: AtomicBool,
    closed_watch: watch::Sender<bool>,
    forced: watch::Sender<bool>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_half: Mutex<Option<OwnedReadHalf>>,
    initial: Mutex<Option<Bytes>>,
    buffer_limit: usize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.closed)
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .field("buffer_limit", &self.buffer_limit)
            .finish()
    }
}

impl Connection {
    /// Wraps an established transport. `initial` carries bytes already read
    /// during protocol detection; they are delivered to the read filter
    /// before any socket read.
    pub fn new(stream: TcpStream, initial: Option<Bytes>) -> Arc<Self> {
        let _ = stream.set_nodelay(true);
        let remote_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (read_disable, _) = watch::channel(false);
        let (closed_watch, _) = watch::channel(false);
        let (forced, forced_rx) = watch::channel(false);

        let conn = Arc::new(Connection {
            id: alloc_conn_id(),
            remote_addr,
            write_tx,
            read_disable,
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            closed_watch,
            forced,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            read_half: Mutex::new(Some(read_half)),
            initial: Mutex::new(initial),
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        });

        tokio::spawn(Self::write_loop(
            Arc::downgrade(&conn),
            write_half,
            write_rx,
            forced_rx,
        ));
        conn
    }

    /// Dials an upstream host. Timeout maps to `ConnectTimeout`, refusal to
    /// `ConnectFailed`; the caller does the failure accounting.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Arc<Self>, ConnectionEvent> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Err(_) => Err(ConnectionEvent::ConnectTimeout),
            Ok(Err(e)) => {
                debug!("connect {} failed: {}", addr, e);
                Err(ConnectionEvent::ConnectFailed)
            }
            Ok(Ok(stream)) => Ok(Self::new(stream, None)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn buffer_limit(&self) -> usize {
        self.buffer_limit
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn add_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn set_read_disable(&self, disable: bool) {
        let _ = self.read_disable.send(disable);
    }

    /// Queues bytes on the writer task.
    pub fn write(&self, data: Bytes) -> TrellisResult<()> {
        if self.is_closed() {
            return Err(TrellisError::ConnectionClosed);
        }
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.write_tx
            .send(WriteCmd::Data(data))
            .map_err(|_| TrellisError::ConnectionClosed)
    }

    /// Local close: flush queued writes, shut the socket down, notify
    /// listeners with `event`.
    pub fn close(&self, event: ConnectionEvent) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.write_tx.send(WriteCmd::Close);
        let _ = self.closed_watch.send(true);
        self.fire_event(event);
    }

    /// Hard close: no flush, both IO loops abandon the socket at once.
    pub fn force_close(&self) {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        let _ = self.forced.send(true);
        let _ = self.closed_watch.send(true);
        if first {
            self.fire_event(ConnectionEvent::LocalClose);
        }
    }

    fn on_remote_close(&self, event: ConnectionEvent) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.write_tx.send(WriteCmd::Close);
        let _ = self.closed_watch.send(true);
        self.fire_event(event);
    }

    /// Resolves once the connection has closed for any reason.
    pub async fn closed(&self) {
        let mut rx = self.closed_watch.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn fire_event(&self, event: ConnectionEvent) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    /// Spawns the read task. Callable once; bytes flow into `filter` in
    /// arrival order.
    pub fn start_read_loop(self: Arc<Self>, filter: Arc<dyn ReadFilter>) {
        let conn = self;
        let Some(mut read_half) = conn.read_half.lock().unwrap().take() else {
            error!("conn {} read loop already started", conn.id);
            return;
        };
        tokio::spawn(async move {
            let mut buf = read_buffer_pool().acquire();
            if let Some(initial) = conn.initial.lock().unwrap().take() {
                buf.append(&initial);
            }
            let mut disable_rx = conn.read_disable.subscribe();
            let mut closed_rx = conn.closed_watch.subscribe();
            if !buf.is_empty() {
                if filter.on_data(&mut buf).await == FilterStatus::Stop {
                    conn.set_read_disable(true);
                }
            }
            loop {
                while *disable_rx.borrow() {
                    if disable_rx.changed().await.is_err() {
                        read_buffer_pool().release(buf);
                        return;
                    }
                }
                if conn.is_closed() {
                    read_buffer_pool().release(buf);
                    return;
                }
                let read = tokio::select! {
                    read = read_half.read_buf(buf.as_mut()) => read,
                    _ = closed_rx.changed() => {
                        read_buffer_pool().release(buf);
                        return;
                    }
                };
                match read {
                    Ok(0) => {
                        debug!("conn {} closed by peer", conn.id);
                        conn.on_remote_close(ConnectionEvent::RemoteClose);
                        read_buffer_pool().release(buf);
                        return;
                    }
                    Ok(n) => {
                        conn.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                        if filter.on_data(&mut buf).await == FilterStatus::Stop
                            || buf.len() > conn.buffer_limit
                        {
                            conn.set_read_disable(true);
                        }
                    }
                    Err(e) => {
                        debug!("conn {} read error: {}", conn.id, e);
                        conn.on_remote_close(ConnectionEvent::RemoteClose);
                        read_buffer_pool().release(buf);
                        return;
                    }
                }
            }
        });
    }

    async fn write_loop(
        conn: std::sync::Weak<Connection>,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<WriteCmd>,
        mut forced_rx: watch::Receiver<bool>,
    ) {
        loop {
            let cmd = tokio::select! {
                cmd = rx.recv() => cmd,
                _ = forced_rx.changed() => {
                    // Forced close drops the socket without flushing.
                    return;
                }
            };
            let Some(cmd) = cmd else {
                return;
            };
            match cmd {
                WriteCmd::Data(data) => {
                    if let Err(e) = write_half.write_all(&data).await {
                        debug!("write error: {}", e);
                        if let Some(conn) = conn.upgrade() {
                            conn.on_remote_close(ConnectionEvent::RemoteClose);
                        }
                        return;
                    }
                }
                WriteCmd::Close => {
                    let _ = write_half.shutdown().await;
                    return;
                }
            }
        }
    }
}

/// Replays bytes consumed during protocol detection in front of the raw
/// stream; the HTTP/2 handshake reads the preface from here.
pub struct RewindIo {
    pre: Bytes,
    inner: TcpStream,
}

impl RewindIo {
    pub fn new(pre: Bytes, inner: TcpStream) -> Self {
        RewindIo { pre, inner }
    }
}

impl AsyncRead for RewindIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.pre.is_empty() {
            let n = self.pre.len().min(buf.remaining());
            let chunk = self.pre.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RewindIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct CollectFilter {
        tx: mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl ReadFilter for CollectFilter {
        async fn on_data(&self, buf: &mut IoBuffer) -> FilterStatus {
            let n = buf.len();
            let _ = self.tx.send(buf.drain_to(n));
            FilterStatus::Continue
        }
    }

    struct EventRecorder {
        tx: mpsc::UnboundedSender<ConnectionEvent>,
    }

    impl ConnectionEventListener for EventRecorder {
        fn on_event(&self, event: ConnectionEvent) {
            let _ = self.tx.send(event);
        }
    }

    #[tokio::test]
    async fn read_write_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let client = TcpStream::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        let conn = Connection::new(server, None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.clone().start_read_loop(Arc::new(CollectFilter { tx }));

        let (mut client_read, mut client_write) = client.into_split();
        client_write.write_all(b"ping").await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(&got[..], b"ping");

        conn.write(Bytes::from_static(b"pong")).unwrap();
        let mut out = [0u8; 4];
        client_read.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"pong");
    }

    #[tokio::test]
    async fn remote_close_fires_event_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let client = TcpStream::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        let conn = Connection::new(server, None);
        let (etx, mut erx) = mpsc::unbounded_channel();
        conn.add_event_listener(Arc::new(EventRecorder { tx: etx }));
        let (tx, _rx) = mpsc::unbounded_channel();
        conn.clone().start_read_loop(Arc::new(CollectFilter { tx }));

        drop(client);
        assert_eq!(erx.recv().await.unwrap(), ConnectionEvent::RemoteClose);
        assert!(conn.is_closed());
        assert!(conn.write(Bytes::from_static(b"x")).is_err());
    }

    #[tokio::test]
    async fn connect_refused_maps_to_connect_failed() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Connection::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.connect_failure());
    }
}
