//! Tunables for the demultiplexer and the aggregator.
//!
//! Both structs implement [`Default`] with the values used in production;
//! override individual fields with the `with_*` builders or from CLI flags
//! (see `main.rs`).

/// Upper bound on a single datagram we expect to read.  Chosen above the
/// common 1500-byte MTU with room for jumbo-ish payloads.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 3000;

/// Pending-but-unaccepted peers a demultiplexer buffers before its read loop
/// stalls.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 128;

/// Capacity of the aggregator's shared accept queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Configuration for a [`crate::demux::PacketDemultiplexer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxConfig {
    /// Bytes reserved for each `recv_from`.  Longer datagrams are truncated
    /// by the OS.
    pub read_buffer_size: usize,
    /// Capacity of the accept queue.  When full, the read loop blocks until
    /// `accept()` drains it.
    pub accept_backlog: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
        }
    }
}

impl DemuxConfig {
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog.max(1);
        self
    }
}

/// What a listener task does when the aggregator's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait for room.  Stalls only the overloaded listener.
    #[default]
    Block,
    /// Log, close and discard the new connection.
    DropNewest,
}

/// Configuration for a [`crate::aggregator::ListenerAggregator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Capacity of the shared accept queue (minimum 1).
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::Block,
        }
    }
}

impl AggregatorConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }
}
