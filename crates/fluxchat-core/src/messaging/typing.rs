//! Ephemeral typing signals.
//!
//! Typing state is a per-participant record overwritten in place under
//! the conversation, never appended. The writer schedules an auto-clear
//! a few seconds after each `true` write; because that clear can be
//! lost in transit, readers additionally treat any signal older than
//! the freshness window as not-typing. Neither side persists history.

use crate::error::Result;
use crate::identity::IdentityKey;
use crate::logging::RedactedKey;
use crate::store::{SharedStore, Subscription};
use crate::task::{sleep_or_shutdown, TaskHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before a `true` signal is automatically cleared by the writer.
pub const TYPING_AUTO_CLEAR: Duration = Duration::from_millis(2500);

/// Maximum age a signal may have and still be shown as active.
pub const TYPING_FRESHNESS_MS: i64 = 5000;

/// Reader-side sweep interval for signals that go stale without a
/// clear write arriving.
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A typing signal as persisted in the store. Field names are
/// wire-exact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    /// Whether the participant is currently typing.
    pub is_typing: bool,
    /// When the signal was written, Unix milliseconds.
    pub timestamp_ms: i64,
}

impl TypingSignal {
    /// Whether the signal should still be displayed as active.
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.is_typing && now_ms.saturating_sub(self.timestamp_ms) < TYPING_FRESHNESS_MS
    }
}

/// Callback invoked with each effective typing change.
pub type TypingCallback = Arc<dyn Fn(&IdentityKey, bool) + Send + Sync>;

/// Live typing subscription. Dropping it stops delivery and the
/// staleness sweep.
pub struct TypingWatch {
    subscription: Subscription,
    _sweeper: TaskHandle,
}

impl TypingWatch {
    /// Stop delivery.
    pub fn cancel(&self) {
        self.subscription.cancel();
    }
}

/// Writes the local user's typing state and observes peers'.
pub struct TypingChannel {
    store: Arc<dyn SharedStore>,
    local: IdentityKey,
    clear_tasks: Mutex<HashMap<String, TaskHandle>>,
}

impl TypingChannel {
    /// Create a channel for the local identity.
    pub fn new(store: Arc<dyn SharedStore>, local: IdentityKey) -> Self {
        Self {
            store,
            local,
            clear_tasks: Mutex::new(HashMap::new()),
        }
    }

    fn path(conversation_id: &str, key: &IdentityKey) -> String {
        format!("typing/{conversation_id}/{key}")
    }

    async fn write_signal(
        store: &Arc<dyn SharedStore>,
        conversation_id: &str,
        key: &IdentityKey,
        is_typing: bool,
    ) -> Result<()> {
        let signal = TypingSignal {
            is_typing,
            timestamp_ms: crate::now_ms(),
        };
        store
            .write(&Self::path(conversation_id, key), serde_json::to_value(signal)?)
            .await
    }

    /// Publish the local user's typing state for a conversation.
    ///
    /// A `true` write schedules an automatic clear after
    /// [`TYPING_AUTO_CLEAR`]; renewing before then pushes the clear
    /// back, and an explicit `false` cancels it.
    pub async fn set_typing(&self, conversation_id: &str, is_typing: bool) -> Result<()> {
        Self::write_signal(&self.store, conversation_id, &self.local, is_typing).await?;

        // Replacing the map entry drops (and thereby cancels) any
        // previously scheduled clear.
        let mut tasks = match self.clear_tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.remove(conversation_id);

        if is_typing {
            let store = self.store.clone();
            let local = self.local.clone();
            let cid = conversation_id.to_string();
            let task = TaskHandle::spawn(move |mut shutdown| async move {
                if sleep_or_shutdown(&mut shutdown, TYPING_AUTO_CLEAR).await {
                    if let Err(e) = Self::write_signal(&store, &cid, &local, false).await {
                        warn!(error = %e, "typing auto-clear write failed");
                    }
                }
            });
            tasks.insert(conversation_id.to_string(), task);
        }
        Ok(())
    }

    /// Cancel every pending auto-clear (logout).
    pub fn cancel_pending(&self) {
        let mut tasks = match self.clear_tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.clear();
    }

    /// Observe effective typing state for every participant in a
    /// conversation.
    ///
    /// Updates are filtered for freshness on delivery, and a sweep
    /// reports `false` for signals that go stale with no clear write
    /// ever arriving.
    pub async fn subscribe(
        &self,
        conversation_id: &str,
        callback: impl Fn(&IdentityKey, bool) + Send + Sync + 'static,
    ) -> Result<TypingWatch> {
        let callback: TypingCallback = Arc::new(callback);
        // Participants currently shown as typing, by the deadline at
        // which their last signal goes stale.
        let active: Arc<Mutex<HashMap<String, tokio::time::Instant>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let cb = callback.clone();
        let active_writer = active.clone();
        let subscription = self
            .store
            .subscribe_children(
                &format!("typing/{conversation_id}"),
                Box::new(move |key, value| {
                    let signal: TypingSignal = match serde_json::from_value(value) {
                        Ok(signal) => signal,
                        Err(e) => {
                            debug!(key = %RedactedKey(key), error = %e, "malformed typing signal");
                            return;
                        }
                    };
                    let now_ms = crate::now_ms();
                    let effective = signal.is_active(now_ms);
                    {
                        let mut active = match active_writer.lock() {
                            Ok(active) => active,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        if effective {
                            let age = now_ms.saturating_sub(signal.timestamp_ms).max(0);
                            let remaining =
                                Duration::from_millis((TYPING_FRESHNESS_MS - age) as u64);
                            active.insert(key.to_string(), tokio::time::Instant::now() + remaining);
                        } else {
                            active.remove(key);
                        }
                    }
                    cb(&IdentityKey::new(key), effective);
                }),
            )
            .await?;

        let sweeper = TaskHandle::spawn(move |mut shutdown| async move {
            while sleep_or_shutdown(&mut shutdown, STALE_SWEEP_INTERVAL).await {
                let now = tokio::time::Instant::now();
                let expired: Vec<String> = {
                    let mut map = match active.lock() {
                        Ok(map) => map,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    let expired: Vec<String> = map
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in &expired {
                        map.remove(key);
                    }
                    expired
                };
                for key in expired {
                    callback(&IdentityKey::new(&key), false);
                }
            }
        });

        Ok(TypingWatch {
            subscription,
            _sweeper: sweeper,
        })
    }
}
