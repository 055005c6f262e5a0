//! Offline inbox and redelivery.
//!
//! When direct delivery fails, the full encrypted message record is
//! parked under the recipient's inbox path. While authenticated, a
//! drain loop scans that collection, appends each entry to history and
//! retires it with a tombstone write. The append is keyed by message
//! id, so a crash between append and retire only causes a harmless
//! re-scan, never a duplicate.

use crate::error::{Error, Result};
use crate::identity::{FriendSet, IdentityKey};
use crate::logging::RedactedKey;
use crate::messaging::history::ConversationHistory;
use crate::messaging::message::{MessageId, StoredMessage};
use crate::store::SharedStore;
use crate::task::{sleep_or_shutdown, TaskHandle};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Drain interval while authenticated.
pub const INBOX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive drain failures before connectivity is reported degraded.
pub const STORE_FAILURE_ESCALATION: u32 = 3;

/// Store path of one inbox entry.
pub fn entry_path(recipient: &IdentityKey, id: &MessageId) -> String {
    format!("inbox/{recipient}/{id}")
}

/// Park a message in the recipient's inbox for later redelivery.
pub async fn enqueue(store: &Arc<dyn SharedStore>, message: &StoredMessage) -> Result<()> {
    store
        .write(
            &entry_path(&message.to, &message.id),
            serde_json::to_value(message)?,
        )
        .await
}

/// Callback fired for each message newly appended from the inbox.
pub type ReceivedCallback = Arc<dyn Fn(StoredMessage) + Send + Sync>;

/// Callback fired when repeated store failures degrade connectivity.
pub type DegradedCallback = Arc<dyn Fn() + Send + Sync>;

/// Drains the authenticated user's inbox.
pub struct InboxWorker {
    store: Arc<dyn SharedStore>,
    local: IdentityKey,
    history: Arc<ConversationHistory>,
    friends: FriendSet,
    on_received: ReceivedCallback,
    on_degraded: DegradedCallback,
    consecutive_failures: AtomicU32,
}

impl InboxWorker {
    /// Create a worker for the authenticated identity.
    pub fn new(
        store: Arc<dyn SharedStore>,
        local: IdentityKey,
        history: Arc<ConversationHistory>,
        friends: FriendSet,
        on_received: ReceivedCallback,
        on_degraded: DegradedCallback,
    ) -> Self {
        Self {
            store,
            local,
            history,
            friends,
            on_received,
            on_degraded,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    fn is_friend(&self, key: &IdentityKey) -> bool {
        match self.friends.read() {
            Ok(friends) => friends.contains_key(key),
            Err(_) => false,
        }
    }

    async fn retire(&self, entry_key: &str) -> Result<()> {
        self.store
            .write(&format!("inbox/{}/{entry_key}", self.local), Value::Null)
            .await
    }

    /// Scan the inbox once. Returns how many messages were appended.
    pub async fn drain_once(&self) -> Result<usize> {
        let entries = self
            .store
            .list(&format!("inbox/{}", self.local))
            .await?;

        let mut appended = 0;
        for (entry_key, value) in entries {
            let message: StoredMessage = match serde_json::from_value(value) {
                Ok(message) => message,
                Err(e) => {
                    warn!(entry = %entry_key, error = %e, "malformed inbox entry, retiring");
                    self.retire(&entry_key).await?;
                    continue;
                }
            };

            // Messages from non-friends are untrusted. Logged and
            // retired, never surfaced to the conversation view.
            if !self.is_friend(&message.from) {
                warn!(
                    from = %RedactedKey(message.from.as_str()),
                    error = %Error::UntrustedSender(message.from.to_string()),
                    "dropping inbox entry from non-friend"
                );
                self.retire(&entry_key).await?;
                continue;
            }

            let mut delivered = message.clone();
            delivered.delivered = true;

            // Append is keyed by id. A re-scan of a not-yet-retired
            // entry finds the id already present and only retires.
            if !self
                .history
                .contains(&message.conversation_id, &message.id)
                .await
            {
                self.history.write_private(&delivered).await?;
                self.history.write_shared(&delivered).await?;
                (self.on_received)(delivered);
                appended += 1;
            }

            self.retire(&entry_key).await?;
            debug!(id = %message.id, "inbox entry redelivered");
        }

        Ok(appended)
    }

    fn note_outcome(&self, outcome: &Result<usize>) {
        match outcome {
            Ok(_) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %e, failures, "inbox drain failed");
                if failures == STORE_FAILURE_ESCALATION {
                    (self.on_degraded)();
                }
            }
        }
    }

    /// Spawn the drain loop. Runs until cancelled or logout.
    pub fn spawn(self: &Arc<Self>) -> TaskHandle {
        let worker = self.clone();
        TaskHandle::spawn(move |mut shutdown| async move {
            while sleep_or_shutdown(&mut shutdown, INBOX_POLL_INTERVAL).await {
                let outcome = worker.drain_once().await;
                if let Ok(n) = outcome {
                    if n > 0 {
                        info!(count = n, "redelivered offline messages");
                    }
                }
                worker.note_outcome(&outcome);
            }
            debug!("inbox drain loop stopped");
        })
    }
}
