//! In-process transport implementation.
//!
//! A `MemoryHub` plays the network: each `MemoryTransport` registers an
//! address on the hub, and connecting routes frames straight to the
//! peer's handler. Addresses can be made unreachable to force the
//! timeout path without waiting on real timers.

use super::{DirectChannel, DirectTransport, MessageHandler};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type SharedHandler = Arc<Mutex<Option<Arc<dyn Fn(&str, Vec<u8>) + Send + Sync>>>>;

struct Endpoint {
    handler: SharedHandler,
    reachable: Arc<AtomicBool>,
}

/// The in-process "network" connecting memory transports.
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<Mutex<HashMap<String, Endpoint>>>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport registered on this hub under `address`.
    pub fn endpoint(&self, address: impl Into<String>) -> MemoryTransport {
        let address = address.into();
        let handler: SharedHandler = Arc::new(Mutex::new(None));
        let reachable = Arc::new(AtomicBool::new(true));

        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.insert(
                address.clone(),
                Endpoint {
                    handler: handler.clone(),
                    reachable: reachable.clone(),
                },
            );
        }

        MemoryTransport {
            hub: self.clone(),
            address,
            handler,
            reachable,
        }
    }

    /// Make an address (un)reachable, forcing connect timeouts.
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Ok(endpoints) = self.endpoints.lock() {
            if let Some(endpoint) = endpoints.get(address) {
                endpoint.reachable.store(reachable, Ordering::SeqCst);
            }
        }
    }

    fn lookup(&self, address: &str) -> Option<(SharedHandler, Arc<AtomicBool>)> {
        let endpoints = self.endpoints.lock().ok()?;
        let endpoint = endpoints.get(address)?;
        Some((endpoint.handler.clone(), endpoint.reachable.clone()))
    }
}

/// One client's view of the hub.
pub struct MemoryTransport {
    hub: MemoryHub,
    address: String,
    handler: SharedHandler,
    reachable: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Make this endpoint (un)reachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl DirectTransport for MemoryTransport {
    async fn connect(&self, address: &str, _timeout: Duration) -> Result<Box<dyn DirectChannel>> {
        let (handler, reachable) = self
            .hub
            .lookup(address)
            .ok_or(Error::TransportTimeout)?;

        if !reachable.load(Ordering::SeqCst) {
            return Err(Error::TransportTimeout);
        }

        Ok(Box::new(MemoryChannel {
            from: self.address.clone(),
            peer: address.to_string(),
            peer_handler: handler,
            peer_reachable: reachable,
        }))
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = Some(Arc::from(handler));
        }
    }

    fn local_address(&self) -> Option<String> {
        Some(self.address.clone())
    }
}

struct MemoryChannel {
    from: String,
    peer: String,
    peer_handler: SharedHandler,
    peer_reachable: Arc<AtomicBool>,
}

#[async_trait]
impl DirectChannel for MemoryChannel {
    async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::Transport("peer unreachable".into()));
        }

        let handler = {
            let slot = self
                .peer_handler
                .lock()
                .map_err(|_| Error::Transport("handler lock poisoned".into()))?;
            slot.clone()
        };

        match handler {
            Some(handler) => {
                handler(&self.from, data.to_vec());
                Ok(())
            }
            None => Err(Error::Transport("peer not listening".into())),
        }
    }

    fn is_ready(&self) -> bool {
        self.peer_reachable.load(Ordering::SeqCst)
    }

    fn peer_address(&self) -> &str {
        &self.peer
    }
}
