//! Presence publication and observation.
//!
//! A presence record is owned and overwritten only by its subject and
//! readable by anyone holding the identity key. "Online" is derived on
//! the reader side, never stored: a record counts as online only while
//! its `lastSeenMs` is inside the online window. Publication happens on
//! login, visibility changes and logout, not on a timer.

use crate::error::Result;
use crate::identity::IdentityKey;
use crate::logging::RedactedKey;
use crate::store::{SharedStore, Subscription};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How recent `lastSeenMs` must be for an `online` status to count.
pub const ONLINE_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Bounded wait for one-shot presence reads. The store is eventually
/// consistent, so the read resolves with whatever arrived in time.
pub const PRESENCE_READ_TIMEOUT: Duration = Duration::from_millis(800);

/// Reported liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Actively using the app.
    Online,
    /// Logged in but backgrounded.
    Away,
    /// Logged out.
    Offline,
}

/// A presence record as persisted in the store.
///
/// Field names are wire-exact for cross-client compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Reported status.
    pub status: PresenceStatus,
    /// When the subject last reported, Unix milliseconds.
    pub last_seen_ms: i64,
    /// Advertised direct-transport address, when listening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_address: Option<String>,
}

impl PresenceRecord {
    /// The record used when nothing has replicated: offline, never seen.
    pub fn offline() -> Self {
        Self {
            status: PresenceStatus::Offline,
            last_seen_ms: 0,
            transport_address: None,
        }
    }

    /// Derived online check: reported online and seen recently enough.
    pub fn is_online(&self, now_ms: i64) -> bool {
        self.status == PresenceStatus::Online
            && now_ms.saturating_sub(self.last_seen_ms) < ONLINE_WINDOW_MS
    }
}

/// Publishes the local user's presence and observes remote presence.
pub struct PresenceTracker {
    store: Arc<dyn SharedStore>,
    local: IdentityKey,
}

impl PresenceTracker {
    /// Create a tracker for the local identity.
    pub fn new(store: Arc<dyn SharedStore>, local: IdentityKey) -> Self {
        Self { store, local }
    }

    fn public_path(key: &IdentityKey) -> String {
        format!("presence/{key}")
    }

    fn private_path(key: &IdentityKey) -> String {
        format!("users/{key}/presence")
    }

    /// Publish the local user's presence.
    ///
    /// Writes the record to both the public-by-key namespace and the
    /// subject's private namespace; the redundancy keeps reads
    /// available when one replica lags.
    pub async fn publish(
        &self,
        status: PresenceStatus,
        transport_address: Option<String>,
    ) -> Result<()> {
        let record = PresenceRecord {
            status,
            last_seen_ms: crate::now_ms(),
            transport_address,
        };
        let value = serde_json::to_value(&record)?;

        self.store
            .write(&Self::public_path(&self.local), value.clone())
            .await?;
        self.store
            .write(&Self::private_path(&self.local), value)
            .await?;

        debug!(key = %RedactedKey(self.local.as_str()), ?status, "presence published");
        Ok(())
    }

    /// One-shot presence read with a bounded wait.
    ///
    /// Resolves to offline when nothing arrives in time; a slow store
    /// must not stall the send path.
    pub async fn get(&self, key: &IdentityKey) -> PresenceRecord {
        let path = Self::public_path(key);
        let read = self.store.read(&path);
        match tokio::time::timeout(PRESENCE_READ_TIMEOUT, read).await {
            Ok(Ok(Some(value))) => match serde_json::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %RedactedKey(key.as_str()), error = %e, "malformed presence record");
                    PresenceRecord::offline()
                }
            },
            Ok(Ok(None)) => PresenceRecord::offline(),
            Ok(Err(e)) => {
                warn!(key = %RedactedKey(key.as_str()), error = %e, "presence read failed");
                PresenceRecord::offline()
            }
            Err(_) => {
                debug!(key = %RedactedKey(key.as_str()), "presence read timed out");
                PresenceRecord::offline()
            }
        }
    }

    /// Observe every presence update for a key.
    ///
    /// The caller derives "online" with [`PresenceRecord::is_online`];
    /// malformed records are skipped.
    pub async fn subscribe(
        &self,
        key: &IdentityKey,
        callback: impl Fn(PresenceRecord) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.store
            .subscribe(
                &Self::public_path(key),
                Box::new(move |value| {
                    if let Ok(record) = serde_json::from_value::<PresenceRecord>(value) {
                        callback(record);
                    }
                }),
            )
            .await
    }
}
