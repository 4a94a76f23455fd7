//! Per-peer virtual connections over one datagram socket.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────────────────────────────┐
//!   datagrams ───▶│ read loop (one task per demultiplexer)     │
//!                 │   recv_from ─▶ (segment, peer)             │
//!                 │   ConnectionTable[peer] ─ hit ─▶ push      │
//!                 │                       └ miss ─▶ insert,    │
//!                 │                                 push,      │
//!                 │                                 enqueue ───┼──▶ accept()
//!                 └────────────────────────────────────────────┘
//!
//!   VirtualConnection ── read()  ◀── pending segments (VecDeque<Bytes>)
//!                     └─ write() ──▶ shared socket send_to(peer)
//! ```
//!
//! A [`PacketDemultiplexer`] owns the socket, the [`ConnectionTable`] and a
//! bounded accept queue.  Each distinct sender address gets exactly one live
//! [`VirtualConnection`].  Datagrams carry no FIN, so a connection only ends
//! when its holder closes (or drops) it; the next datagram from that peer
//! then starts a fresh connection.
//!
//! Nothing here adds reliability, sequencing or framing.  Payloads are opaque
//! and delivered in socket arrival order.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::ReadBuffer;
use crate::config::DemuxConfig;
use crate::error::{MuxError, Result};
use crate::socket::{DatagramSocket, UdpDatagramSocket};
use crate::transport::{Connection, Listener, Transport};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared by the demultiplexer handle, its read loop and (weakly) by
/// every connection it produced.
struct Shared {
    /// `None` once `close()` released the socket.
    socket: Mutex<Option<Arc<dyn DatagramSocket>>>,
    local_addr: SocketAddr,
    table: ConnectionTable,
    /// Cancelled by `close()`, by dropping the handle, or on a fatal
    /// receive error.
    shutdown: CancellationToken,
    /// First terminal error, returned by every `accept()` after shutdown.
    terminal: Mutex<Option<MuxError>>,
}

impl Shared {
    fn socket(&self) -> Result<Arc<dyn DatagramSocket>> {
        self.socket.lock().clone().ok_or(MuxError::Closed)
    }

    /// The error callers see once the demultiplexer has stopped.
    fn terminal_error(&self) -> MuxError {
        self.terminal.lock().clone().unwrap_or(MuxError::Closed)
    }

    /// Record `err` as terminal (first one wins) and stop everything.
    fn fail(&self, err: MuxError) {
        self.terminal.lock().get_or_insert(err);
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// ConnectionTable
// ---------------------------------------------------------------------------

/// Concurrency-safe map from peer address to its live connection.
///
/// Invariant: at most one open connection per peer.  An entry whose
/// connection was closed is replaced, never reused.
pub(crate) struct ConnectionTable {
    peers: Mutex<HashMap<SocketAddr, Arc<ConnInner>>>,
}

impl ConnectionTable {
    fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Return the open connection for `peer`, creating it with `make` when
    /// absent or closed.  The flag is `true` when a new one was created.
    fn get_or_insert_with(
        &self,
        peer: SocketAddr,
        make: impl FnOnce() -> Arc<ConnInner>,
    ) -> (Arc<ConnInner>, bool) {
        let mut peers = self.peers.lock();
        if let Some(existing) = peers.get(&peer) {
            if !existing.is_closed() {
                return (Arc::clone(existing), false);
            }
        }
        let conn = make();
        peers.insert(peer, Arc::clone(&conn));
        (conn, true)
    }

    /// Remove `peer` only if it still maps to `conn`; a newer connection for
    /// the same peer is left alone.
    fn remove_if_same(&self, peer: SocketAddr, conn: &Arc<ConnInner>) -> bool {
        let mut peers = self.peers.lock();
        match peers.get(&peer) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                peers.remove(&peer);
                true
            }
            _ => false,
        }
    }

    fn drain(&self) -> Vec<Arc<ConnInner>> {
        self.peers.lock().drain().map(|(_, conn)| conn).collect()
    }
}

// ---------------------------------------------------------------------------
// VirtualConnection
// ---------------------------------------------------------------------------

struct ConnInner {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    /// Unread segments in arrival order.  The front may be partially
    /// consumed.
    pending: Mutex<VecDeque<Bytes>>,
    readable: Notify,
    closed: AtomicBool,
    owner: Weak<Shared>,
    /// Clone of the owner's shutdown token.
    shutdown: CancellationToken,
}

impl ConnInner {
    fn new(owner: &Arc<Shared>, remote_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local_addr: owner.local_addr,
            remote_addr,
            pending: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            closed: AtomicBool::new(false),
            owner: Arc::downgrade(owner),
            shutdown: owner.shutdown.clone(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue `segment`.  Returns `false`, leaving the segment unqueued, when
    /// the connection is already closed.
    fn push(&self, segment: Bytes) -> bool {
        {
            let mut pending = self.pending.lock();
            // `close()` flips the flag under this same lock.
            if self.is_closed() {
                return false;
            }
            pending.push_back(segment);
        }
        self.readable.notify_waiters();
        true
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        let mut pending = self.pending.lock();
        let Some(front) = pending.front_mut() else {
            return Ok(0);
        };
        let n = front.len().min(buf.len());
        buf[..n].copy_from_slice(&front[..n]);
        front.advance(n);
        if front.is_empty() {
            pending.pop_front();
        }
        Ok(n)
    }

    async fn readable(&self) -> Result<()> {
        loop {
            // Register interest before checking, so a push racing with the
            // check still wakes us.
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.pending.lock().is_empty() {
                return Ok(());
            }
            if self.is_closed() {
                return Err(MuxError::Closed);
            }
            if self.shutdown.is_cancelled() {
                return Err(self.owner_error());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        if self.shutdown.is_cancelled() {
            return Err(self.owner_error());
        }
        let owner = self.owner.upgrade().ok_or(MuxError::Closed)?;
        let socket = owner.socket()?;
        drop(owner);
        Ok(socket.send_to(buf, self.remote_addr).await?)
    }

    fn owner_error(&self) -> MuxError {
        self.owner
            .upgrade()
            .map(|owner| owner.terminal_error())
            .unwrap_or(MuxError::Closed)
    }
}

/// An emulated stream connection to one remote peer.
///
/// Produced exactly once by [`PacketDemultiplexer::accept`].  Dropping the
/// handle closes it.
pub struct VirtualConnection {
    inner: Arc<ConnInner>,
}

impl VirtualConnection {
    /// Copy queued bytes into `buf`, at most one datagram's worth per call.
    ///
    /// A partially consumed datagram stays at the front of the queue for the
    /// next call.  Never waits: `Ok(0)` means nothing is queued right now.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    /// Wait until [`read`](Self::read) would return data.
    ///
    /// Fails with [`MuxError::Closed`] once this connection is closed, or with
    /// the demultiplexer's terminal error once it stops.
    pub async fn readable(&self) -> Result<()> {
        self.inner.readable().await
    }

    /// Send `buf` to the peer as one datagram.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf).await
    }

    /// Remove this connection from its demultiplexer.  Idempotent.
    ///
    /// Unread bytes are discarded; the peer's next datagram is accepted as a
    /// new connection.
    pub fn close(&self) -> Result<()> {
        {
            let mut pending = self.inner.pending.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            pending.clear();
        }
        if let Some(owner) = self.inner.owner.upgrade() {
            owner
                .table
                .remove_if_same(self.inner.remote_addr, &self.inner);
        }
        self.inner.readable.notify_waiters();
        log::debug!("[demux] closed virtual connection to {}", self.inner.remote_addr);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Total unread bytes queued for this connection.
    pub fn pending_bytes(&self) -> usize {
        self.inner.pending.lock().iter().map(Bytes::len).sum()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }
}

impl Drop for VirtualConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for VirtualConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualConnection")
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

#[async_trait]
impl Connection for VirtualConnection {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf).await
    }

    async fn close(&mut self) -> Result<()> {
        VirtualConnection::close(self)
    }

    async fn readable(&self) -> Result<()> {
        self.inner.readable().await
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }
}

// ---------------------------------------------------------------------------
// PacketDemultiplexer
// ---------------------------------------------------------------------------

/// Presents one datagram socket as a listener of per-peer connections.
pub struct PacketDemultiplexer {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<VirtualConnection>>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PacketDemultiplexer {
    /// Bind a UDP socket on `address` and start demultiplexing.
    pub async fn listen(address: &str) -> Result<Self> {
        Self::listen_with(address, DemuxConfig::default()).await
    }

    pub async fn listen_with(address: &str, config: DemuxConfig) -> Result<Self> {
        let socket = UdpDatagramSocket::bind(address).await?;
        Self::from_socket(Arc::new(socket), config)
    }

    /// Demultiplex an already-bound socket.  Must be called inside a tokio
    /// runtime: the read loop is spawned immediately.
    pub fn from_socket(socket: Arc<dyn DatagramSocket>, config: DemuxConfig) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let shared = Arc::new(Shared {
            socket: Mutex::new(Some(Arc::clone(&socket))),
            local_addr,
            table: ConnectionTable::new(),
            shutdown: CancellationToken::new(),
            terminal: Mutex::new(None),
        });

        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let buffer = ReadBuffer::new(config.read_buffer_size);
        let handle = tokio::spawn(read_loop(Arc::clone(&shared), socket, accept_tx, buffer));

        log::info!("[demux] listening on {local_addr}");

        Ok(Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            read_loop: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for the next previously unseen peer.
    ///
    /// After `close()` every call returns [`MuxError::Closed`].  After a
    /// fatal receive error, peers discovered before the failure are still
    /// handed out; then every call returns the terminal error.
    pub async fn accept(&self) -> Result<VirtualConnection> {
        if self.shared.shutdown.is_cancelled() {
            return self.after_shutdown();
        }
        tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => self.after_shutdown(),
            conn = async { self.accept_rx.lock().await.recv().await } => {
                conn.ok_or_else(|| self.shared.terminal_error())
            }
        }
    }

    fn after_shutdown(&self) -> Result<VirtualConnection> {
        if !self.closed.load(Ordering::Acquire) {
            if let Ok(mut rx) = self.accept_rx.try_lock() {
                if let Ok(conn) = rx.try_recv() {
                    return Ok(conn);
                }
            }
        }
        Err(self.shared.terminal_error())
    }

    /// Stop the read loop, wait for it to exit and release the socket.
    ///
    /// A second call returns [`MuxError::Closed`] and does nothing else.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(MuxError::Closed);
        }
        self.shared.shutdown.cancel();

        let handle = self.read_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("[demux] read loop for {} ended abnormally: {e}", self.shared.local_addr);
            }
        }

        for conn in self.shared.table.drain() {
            conn.readable.notify_waiters();
        }
        self.shared.socket.lock().take();

        log::info!("[demux] closed {}", self.shared.local_addr);
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Number of peers with a live connection.
    pub fn connection_count(&self) -> usize {
        self.shared.table.len()
    }

    /// The terminal error, if the read loop has stopped.
    pub fn terminal_error(&self) -> Option<MuxError> {
        self.shared
            .shutdown
            .is_cancelled()
            .then(|| self.shared.terminal_error())
    }
}

impl Drop for PacketDemultiplexer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl Listener for PacketDemultiplexer {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let conn = PacketDemultiplexer::accept(self).await?;
        Ok(Box::new(conn))
    }

    async fn close(&self) -> Result<()> {
        PacketDemultiplexer::close(self).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

async fn read_loop(
    shared: Arc<Shared>,
    socket: Arc<dyn DatagramSocket>,
    accept_tx: mpsc::Sender<VirtualConnection>,
    mut buffer: ReadBuffer,
) {
    let local = shared.local_addr;

    loop {
        let received = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            r = socket.recv_from(buffer.acquire()) => r,
        };

        let (len, peer) = match received {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[demux] {local} receive failed, stopping: {e}");
                shared.fail(MuxError::FatalSocket(Arc::new(e)));
                break;
            }
        };
        if len == 0 {
            continue;
        }

        let segment = buffer.segment(len);
        let (conn, created) = route(&shared, peer, segment);
        log::trace!("[demux] {local} ← {peer} {len} bytes");

        if created {
            log::debug!("[demux] {local} new peer {peer}");
            let handle = VirtualConnection { inner: conn };
            // Blocks when the backlog is full: backpressure onto the socket.
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => break,
                sent = accept_tx.send(handle) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    }

    log::debug!("[demux] {local} read loop stopped");
}

/// Queue `segment` on `peer`'s open connection, creating one if needed.
///
/// The payload is queued before a new connection becomes visible to
/// `accept()`, so the first read already sees it.  A connection closed
/// between lookup and push rejects the segment; the lookup then replaces it.
fn route(shared: &Arc<Shared>, peer: SocketAddr, segment: Bytes) -> (Arc<ConnInner>, bool) {
    loop {
        let (conn, created) = shared
            .table
            .get_or_insert_with(peer, || ConnInner::new(shared, peer));
        if conn.push(segment.clone()) {
            return (conn, created);
        }
    }
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

/// The `udp` transport kind: every bind produces a [`PacketDemultiplexer`].
#[derive(Debug, Clone, Default)]
pub struct UdpTransport {
    config: DemuxConfig,
}

impl UdpTransport {
    pub fn new(config: DemuxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn bind(&self, address: &str) -> Result<Box<dyn Listener>> {
        let demux = PacketDemultiplexer::listen_with(address, self.config.clone()).await?;
        Ok(Box::new(demux))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;
    use tokio::time::timeout;

    /// In-memory socket: tests inject datagrams through a channel and
    /// inspect what connections wrote.
    struct MemorySocket {
        local: SocketAddr,
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<(Vec<u8>, SocketAddr)>>>,
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
        /// Datagrams taken off `inbound` by the read loop.
        received: std::sync::atomic::AtomicUsize,
    }

    type Inject = mpsc::UnboundedSender<io::Result<(Vec<u8>, SocketAddr)>>;

    fn memory_socket() -> (Arc<MemorySocket>, Inject) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sock = Arc::new(MemorySocket {
            local: addr(9000),
            inbound: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            received: std::sync::atomic::AtomicUsize::new(0),
        });
        (sock, tx)
    }

    #[async_trait]
    impl DatagramSocket for MemorySocket {
        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            match self.inbound.lock().await.recv().await {
                Some(Ok((data, from))) => {
                    self.received.fetch_add(1, Ordering::SeqCst);
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok((n, from))
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }

        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.sent.lock().push((buf.to_vec(), target));
            Ok(buf.len())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local)
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn demux(sock: Arc<MemorySocket>) -> PacketDemultiplexer {
        PacketDemultiplexer::from_socket(sock, DemuxConfig::default()).unwrap()
    }

    async fn accept(d: &PacketDemultiplexer) -> VirtualConnection {
        timeout(Duration::from_secs(2), d.accept())
            .await
            .expect("accept timed out")
            .expect("accept failed")
    }

    #[tokio::test]
    async fn hello_partial_reads() {
        let (sock, inject) = memory_socket();
        let d = demux(sock);
        inject.send(Ok((b"hello".to_vec(), addr(1)))).unwrap();

        let conn = accept(&d).await;
        let mut small = [0u8; 3];
        let mut big = [0u8; 10];

        assert_eq!(conn.read(&mut small).unwrap(), 3);
        assert_eq!(&small, b"hel");
        assert_eq!(conn.read(&mut big).unwrap(), 2);
        assert_eq!(&big[..2], b"lo");
        assert_eq!(conn.read(&mut big).unwrap(), 0);
    }

    #[tokio::test]
    async fn same_peer_reuses_connection() {
        let (sock, inject) = memory_socket();
        let d = demux(sock);
        inject.send(Ok((b"a".to_vec(), addr(1)))).unwrap();
        inject.send(Ok((b"b".to_vec(), addr(1)))).unwrap();
        inject.send(Ok((b"c".to_vec(), addr(2)))).unwrap();

        let first = accept(&d).await;
        let second = accept(&d).await;
        assert_eq!(first.remote_addr(), addr(1));
        assert_eq!(second.remote_addr(), addr(2));

        first.readable().await.unwrap();
        let mut buf = [0u8; 8];
        // "b" may still be in flight; wait until both segments are queued.
        timeout(Duration::from_secs(2), async {
            while first.pending_bytes() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(first.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'a');
        assert_eq!(first.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'b');
        assert_eq!(d.connection_count(), 2);
    }

    #[tokio::test]
    async fn zero_length_datagrams_are_ignored() {
        let (sock, inject) = memory_socket();
        let d = demux(sock);
        inject.send(Ok((Vec::new(), addr(1)))).unwrap();
        inject.send(Ok((b"x".to_vec(), addr(2)))).unwrap();

        let conn = accept(&d).await;
        assert_eq!(conn.remote_addr(), addr(2));
        assert_eq!(d.connection_count(), 1);
    }

    #[tokio::test]
    async fn closed_peer_gets_fresh_connection() {
        let (sock, inject) = memory_socket();
        let d = demux(sock);
        inject.send(Ok((b"one".to_vec(), addr(1)))).unwrap();

        let old = accept(&d).await;
        old.close().unwrap();
        old.close().unwrap();
        assert!(matches!(old.read(&mut [0u8; 4]), Err(MuxError::Closed)));
        assert_eq!(d.connection_count(), 0);

        inject.send(Ok((b"two".to_vec(), addr(1)))).unwrap();
        let fresh = accept(&d).await;
        let mut buf = [0u8; 8];
        assert_eq!(fresh.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"two");
    }

    #[tokio::test]
    async fn stale_close_keeps_newer_entry() {
        let (sock, _inject) = memory_socket();
        let d = demux(sock);
        let table = &d.shared.table;

        let (old, created) = table.get_or_insert_with(addr(1), || ConnInner::new(&d.shared, addr(1)));
        assert!(created);
        old.closed.store(true, Ordering::Release);

        let (new, created) = table.get_or_insert_with(addr(1), || ConnInner::new(&d.shared, addr(1)));
        assert!(created);
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!table.remove_if_same(addr(1), &old));
        assert_eq!(table.len(), 1);
        assert!(table.remove_if_same(addr(1), &new));
    }

    #[tokio::test]
    async fn write_goes_to_peer() {
        let (sock, inject) = memory_socket();
        let d = demux(Arc::clone(&sock));
        inject.send(Ok((b"hi".to_vec(), addr(7)))).unwrap();

        let conn = accept(&d).await;
        assert_eq!(conn.write(b"pong").await.unwrap(), 4);
        assert_eq!(sock.sent.lock().as_slice(), &[(b"pong".to_vec(), addr(7))]);
    }

    #[tokio::test]
    async fn fatal_error_is_terminal() {
        let (sock, inject) = memory_socket();
        let d = demux(sock);
        inject
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "boom")))
            .unwrap();

        for _ in 0..3 {
            let err = timeout(Duration::from_secs(2), d.accept())
                .await
                .expect("accept must not hang")
                .unwrap_err();
            assert!(matches!(err, MuxError::FatalSocket(_)), "got {err:?}");
        }
        assert!(matches!(d.terminal_error(), Some(MuxError::FatalSocket(_))));
        d.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_accept_and_is_idempotent() {
        let (sock, _inject) = memory_socket();
        let d = Arc::new(demux(sock));

        let waiter = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.accept().await })
        };
        tokio::task::yield_now().await;

        d.close().await.unwrap();
        let res = timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert!(matches!(res, Err(MuxError::Closed)));
        assert!(matches!(d.close().await, Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn readable_wakes_on_data_and_on_close() {
        let (sock, inject) = memory_socket();
        let d = demux(sock);
        inject.send(Ok((b"a".to_vec(), addr(1)))).unwrap();

        let conn = accept(&d).await;
        conn.read(&mut [0u8; 1]).unwrap();

        let wait = conn.readable();
        tokio::pin!(wait);
        assert!(timeout(Duration::from_millis(50), &mut wait).await.is_err());

        inject.send(Ok((b"b".to_vec(), addr(1)))).unwrap();
        timeout(Duration::from_secs(2), &mut wait).await.unwrap().unwrap();

        d.close().await.unwrap();
        assert!(conn.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn write_after_demux_close_fails() {
        let (sock, inject) = memory_socket();
        let d = demux(sock);
        inject.send(Ok((b"a".to_vec(), addr(1)))).unwrap();
        let conn = accept(&d).await;

        d.close().await.unwrap();
        assert!(matches!(conn.write(b"late").await, Err(MuxError::Closed)));

        // Bytes queued before the close stay readable on a held handle.
        conn.readable().await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).unwrap(), 1);
        assert!(matches!(conn.readable().await, Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn demux_close_wakes_blocked_readable() {
        let (sock, inject) = memory_socket();
        let d = demux(sock);
        inject.send(Ok((b"a".to_vec(), addr(1)))).unwrap();
        let conn = accept(&d).await;
        conn.read(&mut [0u8; 1]).unwrap();

        let wait = conn.readable();
        tokio::pin!(wait);
        assert!(timeout(Duration::from_millis(50), &mut wait).await.is_err());

        let (closed, woke) = tokio::join!(d.close(), timeout(Duration::from_secs(2), &mut wait));
        closed.unwrap();
        assert!(matches!(woke.expect("readable never woke"), Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn full_backlog_stops_the_read_loop() {
        let (sock, inject) = memory_socket();
        let d = PacketDemultiplexer::from_socket(
            Arc::clone(&sock) as Arc<dyn DatagramSocket>,
            DemuxConfig::default().with_accept_backlog(1),
        )
        .unwrap();
        for port in 1..=3 {
            inject.send(Ok((b"x".to_vec(), addr(port)))).unwrap();
        }

        // Peer 1 fills the backlog, peer 2 waits to be enqueued, peer 3 is
        // still in the socket.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sock.received.load(Ordering::SeqCst), 2);
        assert_eq!(d.connection_count(), 2);

        assert_eq!(accept(&d).await.remote_addr(), addr(1));
        timeout(Duration::from_secs(2), async {
            while sock.received.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("read loop never resumed");
        assert_eq!(accept(&d).await.remote_addr(), addr(2));
        assert_eq!(accept(&d).await.remote_addr(), addr(3));
    }

    #[tokio::test]
    async fn fatal_error_still_hands_out_known_peers() {
        let (sock, inject) = memory_socket();
        let d = demux(sock);
        inject.send(Ok((b"a".to_vec(), addr(1)))).unwrap();
        inject.send(Ok((b"b".to_vec(), addr(2)))).unwrap();
        inject
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "boom")))
            .unwrap();

        timeout(Duration::from_secs(2), async {
            while d.terminal_error().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let first = accept(&d).await;
        let second = accept(&d).await;
        assert_eq!(first.remote_addr(), addr(1));
        assert_eq!(second.remote_addr(), addr(2));
        let mut buf = [0u8; 1];
        assert_eq!(second.read(&mut buf).unwrap(), 1);
        assert!(matches!(d.accept().await, Err(MuxError::FatalSocket(_))));
    }

    #[tokio::test]
    async fn closed_connection_rejects_segments() {
        let (sock, _inject) = memory_socket();
        let d = demux(sock);

        let (inner, _) = route(&d.shared, addr(1), Bytes::from_static(b"one"));
        let handle = VirtualConnection { inner: Arc::clone(&inner) };
        handle.close().unwrap();
        assert!(!inner.push(Bytes::from_static(b"late")));
        assert_eq!(handle.pending_bytes(), 0);

        // Routing the same datagram now opens a fresh connection.
        let (fresh, created) = route(&d.shared, addr(1), Bytes::from_static(b"two"));
        assert!(created);
        assert!(!Arc::ptr_eq(&inner, &fresh));
        assert_eq!(fresh.pending.lock().len(), 1);
    }
}
