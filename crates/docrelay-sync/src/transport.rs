//! Transport abstraction for the relay protocol.
//!
//! A [`Transport`] is one bidirectional connection between a hub and a peer.
//! Peers obtain transports from a [`Connector`]; hubs from an [`Acceptor`].
//! Two implementations ship here: in-memory channels for tests and TCP with
//! JSON-lines framing.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::RelayMessage;

/// One connection, shared between a reader loop and a pump.
pub type SharedTransport = Arc<dyn Transport>;

/// A bidirectional message channel.
///
/// Implementations must be thread-safe (Send + Sync). `send` may be called
/// concurrently with a pending `recv`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message.
    ///
    /// Fails with [`SyncError::Disconnected`](crate::SyncError::Disconnected)
    /// once either side closed.
    async fn send(&self, message: RelayMessage) -> Result<()>;

    /// Receive the next message, or `None` once the connection is closed.
    async fn recv(&self) -> Result<Option<RelayMessage>>;

    /// Close the connection. Pending and later `recv` calls return `None`.
    async fn close(&self);

    /// Human-readable name of the remote end, for logs.
    fn label(&self) -> &str;
}

/// Opens connections to a hub.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh connection.
    async fn connect(&self) -> Result<SharedTransport>;
}

/// Accepts connections from peers.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Wait for the next connection. `None` means no more will come.
    async fn accept(&self) -> Result<Option<SharedTransport>>;
}

/// A simple in-memory transport for testing.
///
/// Uses channels to simulate a connection between a peer and a hub.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use tokio::sync::{mpsc, watch, Mutex};

    use crate::error::SyncError;

    const CHANNEL_CAPACITY: usize = 1000;

    /// One end of an in-memory connection.
    pub struct MemoryTransport {
        label: String,
        tx: Mutex<Option<mpsc::Sender<RelayMessage>>>,
        rx: Mutex<mpsc::Receiver<RelayMessage>>,
        closed: watch::Sender<bool>,
    }

    impl MemoryTransport {
        /// Create two connected ends. Each end's label names the other.
        pub fn pair(
            a_label: impl Into<String>,
            b_label: impl Into<String>,
        ) -> (MemoryTransport, MemoryTransport) {
            let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
            let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
            (
                MemoryTransport::new(a_label.into(), a_tx, a_rx),
                MemoryTransport::new(b_label.into(), b_tx, b_rx),
            )
        }

        fn new(
            label: String,
            tx: mpsc::Sender<RelayMessage>,
            rx: mpsc::Receiver<RelayMessage>,
        ) -> Self {
            Self {
                label,
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(rx),
                closed: watch::channel(false).0,
            }
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, message: RelayMessage) -> Result<()> {
            let tx = self.tx.lock().await;
            let Some(tx) = tx.as_ref() else {
                return Err(SyncError::Disconnected);
            };
            tx.send(message).await.map_err(|_| SyncError::Disconnected)
        }

        async fn recv(&self) -> Result<Option<RelayMessage>> {
            let mut closed = self.closed.subscribe();
            if *closed.borrow() {
                return Ok(None);
            }
            let mut rx = self.rx.lock().await;
            tokio::select! {
                message = rx.recv() => Ok(message),
                _ = closed.changed() => Ok(None),
            }
        }

        async fn close(&self) {
            self.closed.send_replace(true);
            // Dropping our sender ends the other side's stream.
            self.tx.lock().await.take();
        }

        fn label(&self) -> &str {
            &self.label
        }
    }

    /// An in-memory "network" with one hub listening on it.
    ///
    /// Peers connect through [`MemoryConnector`]s; the hub accepts through
    /// the network's [`Acceptor`] impl.
    pub struct MemoryNetwork {
        accept_tx: mpsc::Sender<MemoryTransport>,
        accept_rx: Mutex<mpsc::Receiver<MemoryTransport>>,
        online: AtomicBool,
        next_conn: AtomicU64,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            let (accept_tx, accept_rx) = mpsc::channel(CHANNEL_CAPACITY);
            Arc::new(Self {
                accept_tx,
                accept_rx: Mutex::new(accept_rx),
                online: AtomicBool::new(true),
                next_conn: AtomicU64::new(1),
            })
        }

        /// Connect a peer named `label` to the hub.
        pub async fn connect(&self, label: &str) -> Result<MemoryTransport> {
            if !self.is_online() {
                return Err(SyncError::Transport("network offline".into()));
            }
            let n = self.next_conn.fetch_add(1, Ordering::Relaxed);
            let (peer_end, hub_end) = MemoryTransport::pair("hub", format!("{label}#{n}"));
            self.accept_tx
                .send(hub_end)
                .await
                .map_err(|_| SyncError::Transport("hub not listening".into()))?;
            Ok(peer_end)
        }

        /// A connector that dials this network as `label`.
        pub fn connector(self: &Arc<Self>, label: impl Into<String>) -> MemoryConnector {
            MemoryConnector {
                network: Arc::clone(self),
                label: label.into(),
            }
        }

        /// Refuse (or accept again) new connections.
        pub fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        /// Whether new connections are accepted.
        pub fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Acceptor for MemoryNetwork {
        async fn accept(&self) -> Result<Option<SharedTransport>> {
            let mut rx = self.accept_rx.lock().await;
            Ok(rx.recv().await.map(|t| Arc::new(t) as SharedTransport))
        }
    }

    /// Dials a [`MemoryNetwork`].
    pub struct MemoryConnector {
        network: Arc<MemoryNetwork>,
        label: String,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<SharedTransport> {
            let transport = self.network.connect(&self.label).await?;
            Ok(Arc::new(transport))
        }
    }
}

/// TCP transport with JSON-lines framing.
///
/// Each message is one JSON object followed by `\n`, so a connection can be
/// inspected with netcat-style tools.
pub mod tcp {
    use super::*;
    use std::io;

    use serde::{de::DeserializeOwned, Serialize};
    use tokio::io::{
        AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    };
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
    use tokio::sync::{watch, Mutex};

    use crate::error::SyncError;

    /// Longest accepted frame, newline excluded.
    pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

    /// A line ran past the frame limit without a newline.
    #[derive(Debug, thiserror::Error)]
    #[error("frame exceeds {0} bytes")]
    pub struct FrameTooLarge(pub usize);

    /// Read one JSON-lines message of at most [`MAX_FRAME_BYTES`].
    /// `None` on end of stream.
    pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
    where
        R: AsyncBufRead + Unpin,
        T: DeserializeOwned,
    {
        read_frame(reader, MAX_FRAME_BYTES).await
    }

    /// Read one JSON-lines message of at most `max_bytes`.
    ///
    /// A longer line fails with [`FrameTooLarge`] after buffering at most
    /// `max_bytes + 1` bytes of it. The stream is then mid-line and should
    /// be dropped.
    pub async fn read_frame<R, T>(reader: &mut R, max_bytes: usize) -> io::Result<Option<T>>
    where
        R: AsyncBufRead + Unpin,
        T: DeserializeOwned,
    {
        let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
        let mut line = Vec::new();
        loop {
            line.clear();
            let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
            if bytes == 0 {
                return Ok(None);
            }
            if bytes > max_bytes && !line.ends_with(b"\n") {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    FrameTooLarge(max_bytes),
                ));
            }

            let end = line
                .iter()
                .rposition(|b| !matches!(b, b'\n' | b'\r'))
                .map_or(0, |i| i + 1);
            if end == 0 {
                continue;
            }

            let parsed = serde_json::from_slice(&line[..end]).map_err(to_io_error)?;
            return Ok(Some(parsed));
        }
    }

    /// Write one JSON-lines message and flush.
    pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    fn to_io_error(err: serde_json::Error) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }

    pub(super) fn to_sync_error(err: io::Error) -> SyncError {
        // An oversized frame leaves the stream unreadable, so it ends the
        // connection instead of being answered like a bad message.
        if err.get_ref().is_some_and(|inner| inner.is::<FrameTooLarge>()) {
            return SyncError::Transport(err.to_string());
        }
        match err.kind() {
            io::ErrorKind::InvalidData => SyncError::InvalidMessage(err.to_string()),
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => SyncError::Disconnected,
            _ => SyncError::Transport(err.to_string()),
        }
    }

    /// A TCP connection speaking JSON lines.
    pub struct TcpTransport {
        label: String,
        reader: Mutex<BufReader<OwnedReadHalf>>,
        writer: Mutex<OwnedWriteHalf>,
        closed: watch::Sender<bool>,
    }

    impl TcpTransport {
        /// Wrap an established stream.
        pub fn new(stream: TcpStream) -> Self {
            let label = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".into());
            let (reader, writer) = stream.into_split();
            Self {
                label,
                reader: Mutex::new(BufReader::new(reader)),
                writer: Mutex::new(writer),
                closed: watch::channel(false).0,
            }
        }

        /// Connect to `addr`.
        pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| SyncError::Transport(format!("connect failed: {e}")))?;
            stream
                .set_nodelay(true)
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            Ok(Self::new(stream))
        }
    }

    #[async_trait]
    impl Transport for TcpTransport {
        async fn send(&self, message: RelayMessage) -> Result<()> {
            if *self.closed.borrow() {
                return Err(SyncError::Disconnected);
            }
            let mut writer = self.writer.lock().await;
            write_message(&mut *writer, &message)
                .await
                .map_err(to_sync_error)
        }

        async fn recv(&self) -> Result<Option<RelayMessage>> {
            let mut closed = self.closed.subscribe();
            if *closed.borrow() {
                return Ok(None);
            }
            let mut reader = self.reader.lock().await;
            tokio::select! {
                message = read_message(&mut *reader) => message.map_err(to_sync_error),
                _ = closed.changed() => Ok(None),
            }
        }

        async fn close(&self) {
            self.closed.send_replace(true);
            let mut writer = self.writer.lock().await;
            if let Err(error) = writer.shutdown().await {
                tracing::debug!(?error, peer = %self.label, "tcp shutdown failed");
            }
        }

        fn label(&self) -> &str {
            &self.label
        }
    }

    /// Accepts peers on a TCP listener.
    pub struct TcpAcceptor {
        listener: TcpListener,
    }

    impl TcpAcceptor {
        /// Accept on an already bound listener.
        pub fn new(listener: TcpListener) -> Self {
            Self { listener }
        }

        /// Bind and listen on `addr`.
        pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| SyncError::Transport(format!("bind failed: {e}")))?;
            Ok(Self::new(listener))
        }

        /// The bound address.
        pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
            self.listener
                .local_addr()
                .map_err(|e| SyncError::Transport(e.to_string()))
        }
    }

    #[async_trait]
    impl Acceptor for TcpAcceptor {
        async fn accept(&self) -> Result<Option<SharedTransport>> {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .map_err(|e| SyncError::Transport(format!("accept failed: {e}")))?;
            if let Err(error) = stream.set_nodelay(true) {
                tracing::debug!(?error, "set_nodelay failed");
            }
            Ok(Some(Arc::new(TcpTransport::new(stream))))
        }
    }

    /// Dials a hub over TCP.
    #[derive(Debug, Clone)]
    pub struct TcpConnector {
        addr: String,
    }

    impl TcpConnector {
        /// Connector for `addr` (`host:port`).
        pub fn new(addr: impl Into<String>) -> Self {
            Self { addr: addr.into() }
        }
    }

    #[async_trait]
    impl Connector for TcpConnector {
        async fn connect(&self) -> Result<SharedTransport> {
            Ok(Arc::new(TcpTransport::connect(self.addr.as_str()).await?))
        }
    }
}
