//! `netmux`: per-peer virtual connections over one datagram socket, and
//! fan-in of many listeners into one accept stream.
//!
//! # Architecture
//!
//! ```text
//!                        ┌──────────────────────┐
//!   accept() ◀───────────│  ListenerAggregator  │  one shared bounded queue
//!   (tagged origin)      └──┬────────┬───────┬──┘
//!                           │ task   │ task  │ task      (one per listener)
//!                     ┌─────▼──┐ ┌───▼───┐ ┌─▼──────────────────┐
//!                     │  tcp   │ │  tcp  │ │ PacketDemultiplexer │
//!                     └────────┘ └───────┘ └─────────┬──────────┘
//!                                                    │ read loop
//!                                          ┌─────────▼──────────┐
//!                                          │  DatagramSocket    │
//!                                          └────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`transport`]: `Listener`, `Connection` and `Transport` traits
//! - [`registry`]: open map from transport kind to constructor
//! - [`demux`]: `PacketDemultiplexer` and its `VirtualConnection`s
//! - [`aggregator`]: `ListenerAggregator`, fan-in of registered listeners
//! - [`tcp`]: the built-in `tcp` transport
//! - [`socket`]: raw datagram socket trait and its UDP implementation
//! - [`buffer`]: reusable read buffer for the demultiplexer
//! - [`config`]: tunables and their defaults
//! - [`error`]: [`MuxError`]
//!
//! Nothing here provides reliability, retransmission, congestion control,
//! encryption or framing.  Payloads are opaque bytes.

pub mod aggregator;
pub mod buffer;
pub mod config;
pub mod demux;
pub mod error;
pub mod registry;
pub mod socket;
pub mod tcp;
pub mod transport;

pub use aggregator::{Accepted, ListenerAggregator};
pub use config::{AggregatorConfig, DemuxConfig, OverflowPolicy};
pub use demux::{PacketDemultiplexer, UdpTransport, VirtualConnection};
pub use error::{MuxError, Result};
pub use registry::TransportRegistry;
pub use socket::{DatagramSocket, UdpDatagramSocket};
pub use tcp::TcpTransport;
pub use transport::{Connection, Listener, Transport};

/// Bind a listener of a built-in transport kind (`"tcp"` or `"udp"`).
pub async fn listen(kind: &str, address: &str) -> Result<Box<dyn Listener>> {
    TransportRegistry::with_defaults().listen(kind, address).await
}
