//! Per-conversation connection state machine.
//!
//! States: `Disconnected -> Connecting -> {Direct, Relay}`, with any
//! state falling back to `Disconnected` when the peer's presence is
//! lost. Handshakes happen only on an explicit send attempt or an
//! explicit try-direct request, never eagerly, so a flapping peer
//! cannot trigger connection storms. A lightweight poller re-evaluates
//! presence while the conversation is open and refreshes the state
//! without touching the transport.

use crate::identity::IdentityKey;
use crate::logging::RedactedKey;
use crate::presence::PresenceTracker;
use crate::task::{sleep_or_shutdown, TaskHandle};
use crate::transport::{DirectChannel, DirectTransport};
use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bound on the direct handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);

/// Presence re-evaluation interval while a conversation is open.
pub const CONNECTION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Connection status for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No path known to the peer.
    Disconnected,
    /// Direct handshake in flight.
    Connecting,
    /// Live direct channel established.
    Direct,
    /// Peer reachable through the durable relay store only.
    Relay,
}

/// Client-local connection state. Never persisted.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Current status.
    pub status: ConnectionStatus,
    /// The peer's advertised transport address, when known.
    pub peer_address: Option<String>,
    /// Handshake latency of the last successful direct connect.
    pub last_latency_ms: Option<u64>,
}

impl ConnectionState {
    fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            peer_address: None,
            last_latency_ms: None,
        }
    }
}

type ChangeCallback = Box<dyn Fn(&IdentityKey, &ConnectionState) + Send + Sync>;

/// Tracks and refreshes the connection state for one peer.
pub struct ConnectionMonitor {
    peer: IdentityKey,
    presence: Arc<PresenceTracker>,
    transport: Arc<dyn DirectTransport>,
    state: Mutex<ConnectionState>,
    channel: tokio::sync::Mutex<Option<Box<dyn DirectChannel>>>,
    on_change: Mutex<Option<ChangeCallback>>,
}

impl ConnectionMonitor {
    /// Create a monitor for one peer, starting disconnected.
    pub fn new(
        peer: IdentityKey,
        presence: Arc<PresenceTracker>,
        transport: Arc<dyn DirectTransport>,
    ) -> Self {
        Self {
            peer,
            presence,
            transport,
            state: Mutex::new(ConnectionState::disconnected()),
            channel: tokio::sync::Mutex::new(None),
            on_change: Mutex::new(None),
        }
    }

    /// The peer this monitor tracks.
    pub fn peer(&self) -> &IdentityKey {
        &self.peer
    }

    /// Register a state-change observer (at most one).
    pub fn set_on_change(&self, callback: ChangeCallback) {
        if let Ok(mut slot) = self.on_change.lock() {
            *slot = Some(callback);
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| ConnectionState::disconnected())
    }

    fn update<F: FnOnce(&mut ConnectionState)>(&self, apply: F) {
        let snapshot = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            apply(&mut state);
            state.clone()
        };
        if let Ok(slot) = self.on_change.lock() {
            if let Some(callback) = slot.as_ref() {
                callback(&self.peer, &snapshot);
            }
        }
    }

    /// Attempt to establish a direct channel. Caller-initiated only.
    ///
    /// Returns `true` when a live direct channel is available
    /// afterwards. Failure is absorbed: the state falls back to `Relay`
    /// (peer online, no direct path) or `Disconnected` (peer offline).
    pub async fn attempt_direct(&self) -> bool {
        // Presence gates every attempt, including cached-channel reuse:
        // a channel outliving the peer's session would swallow frames.
        let record = self.presence.get(&self.peer).await;
        if !record.is_online(crate::now_ms()) {
            *self.channel.lock().await = None;
            self.update(|s| *s = ConnectionState::disconnected());
            return false;
        }

        // Peer is online: reuse a live channel rather than re-handshaking.
        {
            let mut channel = self.channel.lock().await;
            match channel.as_ref() {
                Some(existing) if existing.is_ready() => return true,
                Some(_) => {
                    *channel = None;
                }
                None => {}
            }
        }

        let address = match record.transport_address {
            Some(address) => address,
            None => {
                debug!(peer = %RedactedKey(self.peer.as_str()), "peer online without transport address");
                self.update(|s| {
                    s.status = ConnectionStatus::Relay;
                    s.peer_address = None;
                });
                return false;
            }
        };

        self.update(|s| {
            s.status = ConnectionStatus::Connecting;
            s.peer_address = Some(address.clone());
        });

        let started = Instant::now();
        match self.transport.connect(&address, HANDSHAKE_TIMEOUT).await {
            Ok(channel) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                info!(
                    peer = %RedactedKey(self.peer.as_str()),
                    latency_ms,
                    "direct channel established"
                );
                *self.channel.lock().await = Some(channel);
                self.update(|s| {
                    s.status = ConnectionStatus::Direct;
                    s.last_latency_ms = Some(latency_ms);
                });
                true
            }
            Err(e) => {
                debug!(peer = %RedactedKey(self.peer.as_str()), error = %e, "direct handshake failed");
                self.update(|s| s.status = ConnectionStatus::Relay);
                false
            }
        }
    }

    /// Send one frame over the established direct channel.
    pub async fn send_direct(&self, data: &[u8]) -> Result<()> {
        let mut channel = self.channel.lock().await;
        match channel.as_ref() {
            Some(open) if open.is_ready() => open.send(data).await,
            _ => {
                *channel = None;
                Err(Error::Transport("no direct channel".into()))
            }
        }
    }

    /// Drop any direct channel and mark the peer disconnected.
    pub async fn disconnect(&self) {
        *self.channel.lock().await = None;
        self.update(|s| *s = ConnectionState::disconnected());
    }

    /// Re-evaluate presence once, without initiating handshakes.
    pub async fn refresh(&self) {
        let record = self.presence.get(&self.peer).await;
        if !record.is_online(crate::now_ms()) {
            let had_channel = {
                let mut channel = self.channel.lock().await;
                channel.take().is_some()
            };
            if had_channel {
                warn!(peer = %RedactedKey(self.peer.as_str()), "peer presence lost, dropping direct channel");
            }
            self.update(|s| *s = ConnectionState::disconnected());
            return;
        }

        let direct_alive = {
            let channel = self.channel.lock().await;
            channel.as_ref().is_some_and(|c| c.is_ready())
        };

        self.update(|s| {
            s.peer_address = record.transport_address.clone();
            s.status = if direct_alive {
                ConnectionStatus::Direct
            } else {
                // Online peer, no live channel: reachable via relay. A
                // new handshake stays caller-initiated.
                ConnectionStatus::Relay
            };
        });
    }

    /// Spawn the presence poller for an open conversation.
    pub fn spawn_poller(self: &Arc<Self>) -> TaskHandle {
        let monitor = self.clone();
        TaskHandle::spawn(move |mut shutdown| async move {
            while sleep_or_shutdown(&mut shutdown, CONNECTION_POLL_INTERVAL).await {
                monitor.refresh().await;
            }
            debug!(peer = %RedactedKey(monitor.peer.as_str()), "connection poller stopped");
        })
    }
}
