//! Fan-in of many listeners into one accept stream.
//!
//! # Architecture
//!
//! ```text
//!   add_listen("tcp", a) ──▶ ListenerEntry ── accept task ──┐
//!   add_listen("udp", b) ──▶ ListenerEntry ── accept task ──┼──▶ shared bounded queue ──▶ accept()
//!   add_listen("tcp", c) ──▶ ListenerEntry ── accept task ──┘       (tagged with origin)
//! ```
//!
//! Each registered listener gets its own background task that loops on the
//! raw `accept()` and pushes `(transport, address, connection-or-error)`
//! onto one queue.  Callers drain that queue without caring which listener
//! produced a connection.  Order across listeners is first come first
//! served and not deterministic.
//!
//! # Backpressure
//!
//! With [`OverflowPolicy::Block`] a task whose push finds the queue full
//! waits for room, stalling only its own listener.  With
//! [`OverflowPolicy::DropNewest`] the connection is closed and discarded
//! with a warning instead.
//!
//! # Shutdown
//!
//! Every entry's signal is a child of one global token.  `close_one` cancels
//! a single child; `close` cancels the parent, which wakes every task and
//! every caller blocked in `accept()`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AggregatorConfig, OverflowPolicy};
use crate::error::{MuxError, Result};
use crate::registry::TransportRegistry;
use crate::transport::{Connection, Listener};

// ---------------------------------------------------------------------------
// Accepted
// ---------------------------------------------------------------------------

/// A connection delivered by [`ListenerAggregator::accept`], tagged with the
/// listener it came from.
pub struct Accepted {
    pub transport: String,
    /// Bound address of the originating listener, as listed by
    /// [`ListenerAggregator::addresses`].
    pub address: String,
    pub connection: Box<dyn Connection>,
}

impl Accepted {
    /// `"transport://address"` of the origin.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.transport, self.address)
    }
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("transport", &self.transport)
            .field("address", &self.address)
            .field("remote_addr", &self.connection.remote_addr())
            .finish()
    }
}

/// One item on the shared queue.
struct Tagged {
    transport: String,
    address: String,
    /// Registration that produced the item; see [`ListenerEntry::generation`].
    generation: u64,
    result: Result<Box<dyn Connection>>,
}

impl Tagged {
    fn into_accepted(self) -> Result<Accepted> {
        match self.result {
            Ok(connection) => Ok(Accepted {
                transport: self.transport,
                address: self.address,
                connection,
            }),
            Err(source) => Err(MuxError::ListenerAccept {
                transport: self.transport,
                address: self.address,
                source: Box::new(source),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ListenerEntry
// ---------------------------------------------------------------------------

type EntryKey = (String, String);

struct ListenerEntry {
    /// Unique per registration, so items queued by a stopped listener are
    /// told apart from a later listener on the same key.
    generation: u64,
    listener: Arc<dyn Listener>,
    signal: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerEntry {
    /// Stop the task, close the listener and wait for the task to exit.
    async fn shutdown(self, key: &EntryKey) -> Result<()> {
        self.signal.cancel();
        let closed = self.listener.close().await;
        if let Err(e) = self.task.await {
            log::warn!("[agg] {}://{} task ended abnormally: {e}", key.0, key.1);
        }
        closed
    }
}

// ---------------------------------------------------------------------------
// ListenerAggregator
// ---------------------------------------------------------------------------

/// Accepts connections from any number of listeners through one call.
pub struct ListenerAggregator {
    registry: TransportRegistry,
    config: AggregatorConfig,
    entries: Mutex<BTreeMap<EntryKey, ListenerEntry>>,
    queue_tx: mpsc::Sender<Tagged>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<Tagged>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    next_generation: AtomicU64,
}

impl Default for ListenerAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerAggregator {
    /// An aggregator over the built-in transports with default settings.
    pub fn new() -> Self {
        Self::with_registry(TransportRegistry::with_defaults())
    }

    pub fn with_registry(registry: TransportRegistry) -> Self {
        Self::with_config(registry, AggregatorConfig::default())
    }

    pub fn with_config(registry: TransportRegistry, config: AggregatorConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            registry,
            config,
            entries: Mutex::new(BTreeMap::new()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Bind a `transport` listener on `address` and start accepting from it.
    ///
    /// Returns the bound address, which is the key for
    /// [`close_one`](Self::close_one) (so `:0` binds are addressable).
    pub async fn add_listen(&self, transport: &str, address: &str) -> Result<SocketAddr> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        let factory = self.registry.get(transport)?;
        let listener: Arc<dyn Listener> = Arc::from(factory.bind(address).await?);
        let local = listener.local_addr();
        let key: EntryKey = (transport.to_string(), local.to_string());

        let rejected = {
            let mut entries = self.entries.lock();
            if self.is_closed() {
                // `close()` ran while we were binding.
                Some(MuxError::Closed)
            } else if entries.contains_key(&key) {
                Some(MuxError::AlreadyListening {
                    transport: key.0.clone(),
                    address: key.1.clone(),
                })
            } else {
                let signal = self.shutdown.child_token();
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let task = tokio::spawn(accept_loop(
                    key.clone(),
                    generation,
                    Arc::clone(&listener),
                    self.queue_tx.clone(),
                    signal.clone(),
                    self.config.overflow,
                ));
                log::info!("[agg] listening on {}://{}", key.0, key.1);
                entries.insert(
                    key,
                    ListenerEntry {
                        generation,
                        listener: Arc::clone(&listener),
                        signal,
                        task,
                    },
                );
                None
            }
        };
        if let Some(err) = rejected {
            let _ = listener.close().await;
            return Err(err);
        }
        Ok(local)
    }

    /// Wait for the next connection from any listener.
    ///
    /// A listener whose raw accept failed surfaces once as
    /// [`MuxError::ListenerAccept`]; its siblings keep running.  Items still
    /// queued from a listener removed by [`close_one`](Self::close_one) are
    /// closed and skipped.  Returns [`MuxError::Closed`] after
    /// [`close`](Self::close).
    pub async fn accept(&self) -> Result<Accepted> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(MuxError::Closed);
            }
            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(MuxError::Closed),
                item = async { self.queue_rx.lock().await.recv().await } => {
                    // The aggregator holds a sender, so the queue never ends
                    // while `self` is alive.
                    item.ok_or(MuxError::Closed)?
                }
            };
            if self.is_live(&item) {
                return item.into_accepted();
            }
            log::debug!(
                "[agg] discarding item queued by stopped {}://{}",
                item.transport,
                item.address
            );
            if let Ok(mut conn) = item.result {
                let _ = conn.close().await;
            }
        }
    }

    fn is_live(&self, item: &Tagged) -> bool {
        let key: EntryKey = (item.transport.clone(), item.address.clone());
        self.entries
            .lock()
            .get(&key)
            .is_some_and(|entry| entry.generation == item.generation)
    }

    /// Stop one listener.  Others are unaffected.
    ///
    /// `address` is the bound address returned by
    /// [`add_listen`](Self::add_listen).
    pub async fn close_one(&self, transport: &str, address: &str) -> Result<()> {
        let key: EntryKey = (transport.to_string(), address.to_string());
        let entry = self.entries.lock().remove(&key);
        let Some(entry) = entry else {
            return Err(MuxError::NotListening {
                transport: key.0,
                address: key.1,
            });
        };
        let res = entry.shutdown(&key).await;
        log::info!("[agg] stopped {}://{}", key.0, key.1);
        res
    }

    /// Stop every listener and wake every blocked `accept()`.
    ///
    /// Returns [`MuxError::Aggregate`] when any listener failed to close, and
    /// [`MuxError::Closed`] on a second call.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(MuxError::Closed);
        }
        self.shutdown.cancel();

        let entries = std::mem::take(&mut *self.entries.lock());
        let mut errors = Vec::new();
        for (key, entry) in entries {
            if let Err(e) = entry.shutdown(&key).await {
                log::warn!("[agg] closing {}://{} failed: {e}", key.0, key.1);
                errors.push(e);
            }
        }

        // Connections still queued are dropped, which closes them.
        if let Ok(mut rx) = self.queue_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }

        log::info!("[agg] closed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MuxError::Aggregate(errors))
        }
    }

    /// `"transport://address"` for every live listener, sorted.
    pub fn addresses(&self) -> Vec<String> {
        self.entries
            .lock()
            .keys()
            .map(|(transport, address)| format!("{transport}://{address}"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for ListenerAggregator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Per-listener accept task
// ---------------------------------------------------------------------------

async fn accept_loop(
    key: EntryKey,
    generation: u64,
    listener: Arc<dyn Listener>,
    queue: mpsc::Sender<Tagged>,
    signal: CancellationToken,
    overflow: OverflowPolicy,
) {
    let (transport, address) = key;

    loop {
        let result = tokio::select! {
            biased;
            _ = signal.cancelled() => break,
            r = listener.accept() => r,
        };

        // Closing the listener makes its accept fail; that is shutdown, not
        // an error worth reporting.
        if signal.is_cancelled() {
            break;
        }

        let failed = result.is_err();
        if let Err(e) = &result {
            log::warn!("[agg] {transport}://{address} accept failed, stopping listener: {e}");
        }

        let item = Tagged {
            transport: transport.clone(),
            address: address.clone(),
            generation,
            result,
        };

        match overflow {
            OverflowPolicy::Block => {
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => break,
                    sent = queue.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            OverflowPolicy::DropNewest => match queue.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    log::warn!("[agg] {transport}://{address} queue full, dropping connection");
                    if let Ok(mut conn) = dropped.result {
                        let _ = conn.close().await;
                    }
                }
                Err(TrySendError::Closed(_)) => break,
            },
        }

        if failed {
            break;
        }
    }

    log::debug!("[agg] {transport}://{address} accept task stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
