//! Entry point for `netmux`.
//!
//! Registers every `--listen kind://address` on one aggregator, logs each
//! accepted connection with its origin and echoes bytes back until the peer
//! closes.  `main.rs` owns only process setup (logging, signal handling,
//! argument parsing); all network work lives in the library.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use netmux::registry::parse_endpoint;
use netmux::{
    Accepted, AggregatorConfig, Connection, DemuxConfig, ListenerAggregator, OverflowPolicy,
    TcpTransport, TransportRegistry, UdpTransport,
};

/// Accept on many listeners at once and echo what peers send.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Listener to register, e.g. tcp://0.0.0.0:9000 or udp://0.0.0.0:9001.
    /// May be repeated.
    #[arg(short, long = "listen", required = true)]
    listen: Vec<String>,

    /// Capacity of the shared accept queue.
    #[arg(long, default_value_t = netmux::config::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Drop new connections instead of blocking when the queue is full.
    #[arg(long)]
    drop_on_overflow: bool,

    /// Read buffer size for UDP listeners (largest datagram accepted).
    #[arg(long, default_value_t = netmux::config::DEFAULT_READ_BUFFER_SIZE)]
    datagram_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    let mut registry = TransportRegistry::new();
    registry.register("tcp", TcpTransport);
    registry.register(
        "udp",
        UdpTransport::new(DemuxConfig::default().with_read_buffer_size(cli.datagram_size)),
    );

    let overflow = if cli.drop_on_overflow {
        OverflowPolicy::DropNewest
    } else {
        OverflowPolicy::Block
    };
    let config = AggregatorConfig::default()
        .with_queue_capacity(cli.queue_capacity)
        .with_overflow(overflow);
    let aggregator = Arc::new(ListenerAggregator::with_config(registry, config));

    for endpoint in &cli.listen {
        let (kind, address) = parse_endpoint(endpoint)?;
        let bound = aggregator
            .add_listen(kind, address)
            .await
            .with_context(|| format!("listen on {endpoint}"))?;
        log::info!("Listening on {kind}://{bound}");
    }

    let acceptor = {
        let aggregator = Arc::clone(&aggregator);
        tokio::spawn(async move {
            loop {
                match aggregator.accept().await {
                    Ok(accepted) => {
                        tokio::spawn(echo(accepted));
                    }
                    Err(e) if e.is_closed() => break,
                    Err(e) => log::warn!("{e}"),
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    log::info!("Shutting down");
    aggregator.close().await?;
    acceptor.await?;
    Ok(())
}

/// Echo everything the peer sends until it closes or an error occurs.
async fn echo(accepted: Accepted) {
    let origin = accepted.origin();
    let mut conn = accepted.connection;
    let peer = conn.remote_addr();
    log::info!("Accepted {peer} on {origin}");

    let mut buf = vec![0u8; netmux::config::DEFAULT_READ_BUFFER_SIZE];
    let result: netmux::Result<()> = async {
        loop {
            conn.readable().await?;
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            conn.write_all(&buf[..n]).await?;
        }
    }
    .await;

    match result {
        Ok(()) => log::info!("{peer} on {origin} done"),
        Err(e) if e.is_closed() => log::info!("{peer} on {origin} done"),
        Err(e) => log::warn!("{peer} on {origin}: {e}"),
    }
    let _ = conn.close().await;
}
