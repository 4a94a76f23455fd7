//! Upstream surface: the listener, connection and transport traits.
//!
//! ```text
//!   Transport::bind(address) ──▶ Box<dyn Listener>
//!                                    │ accept()
//!                                    ▼
//!                               Box<dyn Connection>
//! ```
//!
//! Every transport kind (TCP, the UDP demultiplexer, anything registered
//! later in a [`crate::registry::TransportRegistry`]) implements these once.
//! The aggregator only ever sees the trait objects.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;

/// A bidirectional byte connection to one peer.
///
/// No per-call deadlines are provided; wrap calls in `tokio::time::timeout`
/// when one is needed.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Read up to `buf.len()` bytes.
    ///
    /// Stream transports wait for data and return `Ok(0)` at end of stream.
    /// Datagram-backed connections never wait: `Ok(0)` means nothing is
    /// queued right now (use [`readable`](Self::readable) first to wait).
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf`, returning how many bytes were accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Write all of `buf`, retrying short writes.
    ///
    /// A write that accepts zero bytes fails with
    /// [`std::io::ErrorKind::WriteZero`].
    async fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Close the connection.  Closing twice is not an error.
    async fn close(&mut self) -> Result<()>;

    /// Wait until a `read` would return data.
    ///
    /// The default returns immediately, which is correct for transports
    /// whose `read` already waits.
    async fn readable(&self) -> Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;
}

/// Accepts inbound connections on one bound address.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection.
    ///
    /// Returns [`crate::MuxError::Closed`] once the listener is closed.
    async fn accept(&self) -> Result<Box<dyn Connection>>;

    /// Stop accepting and release the bound address.  A second call returns
    /// [`crate::MuxError::Closed`].
    async fn close(&self) -> Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

/// Constructs listeners for one transport kind.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a new listener on `address`.
    async fn bind(&self, address: &str) -> Result<Box<dyn Listener>>;
}
