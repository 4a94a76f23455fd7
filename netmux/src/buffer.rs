//! Reusable read buffer for the demultiplexer's read loop.
//!
//! One [`ReadBuffer`] backs every `recv_from` a read loop performs.  The
//! scratch area is allocated once at the configured datagram size and never
//! reallocated; each datagram is copied out into a [`Bytes`] segment sized
//! to its own length, so a queued segment pins only its payload.

use bytes::Bytes;

/// Fixed-size receive scratch buffer.
#[derive(Debug)]
pub struct ReadBuffer {
    scratch: Box<[u8]>,
}

impl ReadBuffer {
    /// `datagram_size` is the most bytes a single receive may write.
    pub fn new(datagram_size: usize) -> Self {
        Self {
            scratch: vec![0u8; datagram_size.max(1)].into_boxed_slice(),
        }
    }

    /// The scratch slice to receive into.  Same memory on every call.
    pub fn acquire(&mut self) -> &mut [u8] {
        &mut self.scratch
    }

    /// Copy the first `len` received bytes out as a segment.
    ///
    /// `len` is clamped to the scratch size.
    pub fn segment(&self, len: usize) -> Bytes {
        let len = len.min(self.scratch.len());
        Bytes::copy_from_slice(&self.scratch[..len])
    }
}
