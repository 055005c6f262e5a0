//! # FluxChat Core Library
//!
//! An adaptive-transport messaging engine: messages take the
//! low-latency direct path when the recipient is reachable and degrade
//! to a durable offline inbox on a shared replicated store when not,
//! with no caller-visible difference beyond the reported delivery
//! method.
//!
//! ## Delivery Model
//!
//! - Presence is self-reported and windowed; "online" is derived on the
//!   reader side, never stored.
//! - Direct delivery is attempted only when presence allows it; failure
//!   degrades to the inbox, never to an error.
//! - Every message is dual-written to two overlapping history replicas;
//!   the merge dedups by message id, so redundant delivery is harmless.
//! - Bodies are encrypted with a per-pair derived secret; decryption
//!   failure flags the message rather than dropping it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              engine (facade)            │
//! ├─────────────────────────────────────────┤
//! │ messaging │ presence │ connection │task │
//! ├─────────────────────────────────────────┤
//! │        store seam   │  transport seam   │
//! ├─────────────────────────────────────────┤
//! │     crypto     │       identity         │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod connection;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod logging;
pub mod messaging;
pub mod presence;
pub mod store;
pub mod task;
pub mod transport;

pub use engine::{ChatEngine, EngineEvent};
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current Unix time in milliseconds.
///
/// All record timestamps (`timestampMs`, `lastSeenMs`) use this clock.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
