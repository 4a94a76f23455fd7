//! The `tcp` transport kind, backed by `tokio::net`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{MuxError, Result};
use crate::transport::{Connection, Listener, Transport};

/// Builds [`TcpListener`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&self, address: &str) -> Result<Box<dyn Listener>> {
        Ok(Box::new(TcpListener::bind(address).await?))
    }
}

/// A TCP listener that can be closed through a shared reference.
#[derive(Debug)]
pub struct TcpListener {
    /// `None` after `close()`.  In-flight accepts hold their own clone until
    /// the shutdown token wakes them.
    inner: Mutex<Option<Arc<tokio::net::TcpListener>>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TcpListener {
    pub async fn bind(address: &str) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(address)
            .await
            .map_err(|e| MuxError::bind(address, e))?;
        let local_addr = inner.local_addr().map_err(|e| MuxError::bind(address, e))?;
        log::info!("[tcp] listening on {local_addr}");
        Ok(Self {
            inner: Mutex::new(Some(Arc::new(inner))),
            local_addr,
            shutdown: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let inner = self.inner.lock().clone().ok_or(MuxError::Closed)?;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(MuxError::Closed),
            accepted = inner.accept() => {
                let (stream, peer) = accepted?;
                log::debug!("[tcp] {} accepted {peer}", self.local_addr);
                Ok(Box::new(TcpConnection::new(stream)?))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.inner.lock().take().is_none() {
            return Err(MuxError::Closed);
        }
        self.shutdown.cancel();
        log::info!("[tcp] closed {}", self.local_addr);
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// One accepted TCP stream.
#[derive(Debug)]
pub struct TcpConnection {
    /// `None` after `close()`.
    stream: Option<TcpStream>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        Ok(Self {
            stream: Some(stream),
            local_addr,
            remote_addr,
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(MuxError::Closed)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream()?.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.stream()?.write(buf).await?)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone; the socket is released either way.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}
