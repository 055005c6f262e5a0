//! The direct point-to-point transport seam.
//!
//! The engine treats the transport as an opaque low-latency channel:
//! connect to an advertised address within a bounded timeout, push
//! frames, receive frames through a registered handler. NAT traversal,
//! framing and the handshake itself belong to the implementation.

mod memory;

pub use memory::{MemoryHub, MemoryTransport};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Handler for inbound frames: `(sender address, frame bytes)`.
pub type MessageHandler = Box<dyn Fn(&str, Vec<u8>) + Send + Sync>;

/// The direct transport collaborator.
#[async_trait]
pub trait DirectTransport: Send + Sync {
    /// Open a channel to a peer's advertised address.
    ///
    /// Fails with [`crate::Error::TransportTimeout`] when the handshake
    /// exceeds `timeout`, and [`crate::Error::Transport`] on other
    /// failures. Both are recovered by the caller's relay fallback.
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn DirectChannel>>;

    /// Register the handler invoked for every inbound frame.
    ///
    /// Replaces any previous handler; passing the handler to the
    /// dispatcher exactly once per login is the expected use.
    fn set_message_handler(&self, handler: MessageHandler);

    /// The locally advertised address, once the transport is listening.
    fn local_address(&self) -> Option<String>;
}

/// An open channel to one peer.
#[async_trait]
pub trait DirectChannel: Send + Sync {
    /// Send one frame.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Whether the channel can still deliver.
    fn is_ready(&self) -> bool;

    /// The peer address this channel is connected to.
    fn peer_address(&self) -> &str;
}
