//! Open registry of transport kinds.
//!
//! A [`TransportRegistry`] maps a kind name (`"tcp"`, `"udp"`, ...) to the
//! [`Transport`] that binds listeners for it.  New transports are added with
//! [`TransportRegistry::register`]; the aggregator only ever looks kinds up
//! by name.  Registries are plain values: build one per aggregator (or share
//! one by cloning, entries are `Arc`s).

use std::collections::HashMap;
use std::sync::Arc;

use crate::demux::UdpTransport;
use crate::error::{MuxError, Result};
use crate::tcp::TcpTransport;
use crate::transport::{Listener, Transport};

/// Map from transport kind to constructor.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `tcp` and `udp` kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("tcp", TcpTransport);
        registry.register("udp", UdpTransport::default());
        registry
    }

    /// Register `transport` under `kind`, replacing any previous entry.
    pub fn register(&mut self, kind: impl Into<String>, transport: impl Transport + 'static) {
        self.register_arc(kind, Arc::new(transport));
    }

    pub fn register_arc(&mut self, kind: impl Into<String>, transport: Arc<dyn Transport>) {
        let kind = kind.into();
        if self.transports.insert(kind.clone(), transport).is_some() {
            log::debug!("[registry] replaced transport {kind}");
        }
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(kind)
            .cloned()
            .ok_or_else(|| MuxError::UnsupportedTransport(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.transports.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.transports.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Bind a listener of `kind` on `address`.
    pub async fn listen(&self, kind: &str, address: &str) -> Result<Box<dyn Listener>> {
        self.get(kind)?.bind(address).await
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Split `"kind://address"` into its parts.
pub fn parse_endpoint(endpoint: &str) -> Result<(&str, &str)> {
    match endpoint.split_once("://") {
        Some((kind, address)) if !kind.is_empty() && !address.is_empty() => Ok((kind, address)),
        _ => Err(MuxError::InvalidAddress(endpoint.to_string())),
    }
}
