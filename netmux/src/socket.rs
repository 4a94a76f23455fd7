//! Raw datagram socket abstraction.
//!
//! [`DatagramSocket`] is the only thing a
//! [`crate::demux::PacketDemultiplexer`] needs from the network: receive one
//! datagram with its sender, send one datagram to a peer.  All
//! demultiplexing logic lives elsewhere; this module owns only byte I/O.
//!
//! [`UdpDatagramSocket`] is the production implementation, a thin wrapper
//! around `tokio::net::UdpSocket`.  Receive (from the owning read loop) and
//! send (from any number of connection writers) run in independent
//! directions, so every method takes `&self` and the socket is shared behind
//! an `Arc`.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::{MuxError, Result};

/// A connectionless, datagram-oriented socket.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Receive the next datagram into `buf`, returning `(len, sender)`.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send `buf` as one datagram to `target`.
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Address the socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// An async UDP socket.
#[derive(Debug)]
pub struct UdpDatagramSocket {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    local_addr: SocketAddr,
    inner: UdpSocket,
}

impl UdpDatagramSocket {
    /// Bind a new socket to `address`.
    ///
    /// Passing `127.0.0.1:0` lets the OS choose an ephemeral port.
    pub async fn bind(address: &str) -> Result<Self> {
        let inner = UdpSocket::bind(address)
            .await
            .map_err(|e| MuxError::bind(address, e))?;
        let local_addr = inner.local_addr().map_err(|e| MuxError::bind(address, e))?;
        Ok(Self { local_addr, inner })
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
