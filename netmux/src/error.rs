//! Error type shared by every component of the crate.
//!
//! [`MuxError`] is `Clone` so a terminal error (for example the receive
//! failure that killed a [`crate::demux::PacketDemultiplexer`]) can be handed
//! to every later `accept()` caller.  I/O sources are therefore held behind
//! an [`Arc`].

use std::sync::Arc;

use thiserror::Error;

/// Errors produced by demultiplexers, listeners and the aggregator.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    /// A socket or listener could not be created.
    #[error("bind {address} failed: {source}")]
    Bind {
        address: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The aggregator was asked for a transport kind nobody registered.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Operation on a component whose `close()` already ran.
    #[error("closed")]
    Closed,

    /// The datagram socket failed to receive; terminal for one demultiplexer.
    #[error("fatal socket error: {0}")]
    FatalSocket(#[source] Arc<std::io::Error>),

    /// One registered listener's raw accept failed.  Scoped to that listener.
    #[error("{transport}://{address} accept failed: {source}")]
    ListenerAccept {
        transport: String,
        address: String,
        #[source]
        source: Box<MuxError>,
    },

    #[error("already listening on {transport}://{address}")]
    AlreadyListening { transport: String, address: String },

    #[error("not listening on {transport}://{address}")]
    NotListening { transport: String, address: String },

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// Per-call I/O failure (send, stream read/write).
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// Several independent teardown steps failed.
    #[error("{} errors during close: {}", .0.len(), join(.0))]
    Aggregate(Vec<MuxError>),
}

impl MuxError {
    pub(crate) fn bind(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            address: address.into(),
            source: Arc::new(source),
        }
    }

    /// `true` for [`MuxError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<std::io::Error> for MuxError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

fn join(errors: &[MuxError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, MuxError>;
