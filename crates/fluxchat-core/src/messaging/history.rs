//! Conversation history across two overlapping replicas.
//!
//! Every message is written both to the sender's private per-user log
//! and to the shared per-conversation log, and the same message may
//! surface again through the offline inbox. The merge keys records by
//! message id and keeps the most complete duplicate, so no combination
//! of replica lag and redundant delivery produces doubled history.

use crate::error::Result;
use crate::identity::IdentityKey;
use crate::messaging::message::{MessageId, StoredMessage};
use crate::store::{SharedStore, Subscription};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded wait for one-shot merged reads. Whatever has replicated
/// within the window is returned; a lagging replica never stalls the UI.
pub const HISTORY_COLLECT_WINDOW: Duration = Duration::from_millis(1200);

/// Read and write access to one user's view of conversation history.
pub struct ConversationHistory {
    store: Arc<dyn SharedStore>,
    local: IdentityKey,
}

/// Live merged view of a conversation. Dropping it stops delivery from
/// both replicas.
pub struct HistoryWatch {
    _shared: Subscription,
    _private: Subscription,
}

impl ConversationHistory {
    /// Create a history view for the local identity.
    pub fn new(store: Arc<dyn SharedStore>, local: IdentityKey) -> Self {
        Self { store, local }
    }

    fn shared_path(conversation_id: &str) -> String {
        format!("conversations/{conversation_id}")
    }

    fn private_path(&self, conversation_id: &str) -> String {
        format!("users/{}/conversations/{conversation_id}", self.local)
    }

    fn read_marker_path(&self, conversation_id: &str) -> String {
        format!("users/{}/readMarkers/{conversation_id}", self.local)
    }

    /// Write a message to the local user's private log.
    pub async fn write_private(&self, message: &StoredMessage) -> Result<()> {
        let path = format!(
            "{}/{}",
            self.private_path(&message.conversation_id),
            message.id
        );
        self.store.write(&path, serde_json::to_value(message)?).await
    }

    /// Write a message to the shared per-conversation log.
    pub async fn write_shared(&self, message: &StoredMessage) -> Result<()> {
        let path = format!(
            "{}/{}",
            Self::shared_path(&message.conversation_id),
            message.id
        );
        self.store.write(&path, serde_json::to_value(message)?).await
    }

    /// Whether the private log already holds a message with this id.
    pub async fn contains(&self, conversation_id: &str, id: &MessageId) -> bool {
        let path = format!("{}/{id}", self.private_path(conversation_id));
        matches!(self.store.read(&path).await, Ok(Some(_)))
    }

    /// One-shot merged read of a conversation.
    ///
    /// Collects both replicas for up to [`HISTORY_COLLECT_WINDOW`],
    /// tolerating either one being slow or unavailable, then merges,
    /// sorts by timestamp ascending and trims to the most recent
    /// `limit` entries.
    pub async fn collect(&self, conversation_id: &str, limit: usize) -> Vec<StoredMessage> {
        let shared_path = Self::shared_path(conversation_id);
        let private_path = self.private_path(conversation_id);
        let (shared, private) = tokio::join!(
            self.list_replica(&shared_path),
            self.list_replica(&private_path)
        );

        let mut merge = MergeMap::new();
        for record in shared.into_iter().chain(private) {
            merge.absorb(record);
        }
        merge.into_sorted(limit)
    }

    async fn list_replica(&self, path: &str) -> Vec<Value> {
        let listing = self.store.list(path);
        match tokio::time::timeout(HISTORY_COLLECT_WINDOW, listing).await {
            Ok(Ok(children)) => children.into_iter().map(|(_, v)| v).collect(),
            Ok(Err(e)) => {
                warn!(path, error = %e, "history replica unavailable");
                Vec::new()
            }
            Err(_) => {
                debug!(path, "history replica read timed out");
                Vec::new()
            }
        }
    }

    /// Observe a conversation live, merged across both replicas.
    ///
    /// The callback fires once per new message id and again when a
    /// record upgrades (e.g. its `delivered` flag flips).
    pub async fn subscribe(
        &self,
        conversation_id: &str,
        callback: impl Fn(StoredMessage) + Send + Sync + 'static,
    ) -> Result<HistoryWatch> {
        let callback = Arc::new(callback);
        let merge = Arc::new(Mutex::new(MergeMap::new()));

        let make = |cb: Arc<dyn Fn(StoredMessage) + Send + Sync>,
                    merge: Arc<Mutex<MergeMap>>| {
            Box::new(move |_key: &str, value: Value| {
                let absorbed = {
                    let mut merge = match merge.lock() {
                        Ok(merge) => merge,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    merge.absorb_new(value)
                };
                if let Some(message) = absorbed {
                    cb(message);
                }
            }) as crate::store::ChildCallback
        };

        let shared = self
            .store
            .subscribe_children(
                &Self::shared_path(conversation_id),
                make(callback.clone(), merge.clone()),
            )
            .await?;
        let private = self
            .store
            .subscribe_children(&self.private_path(conversation_id), make(callback, merge))
            .await?;

        Ok(HistoryWatch {
            _shared: shared,
            _private: private,
        })
    }

    /// Record that the local user has read the conversation up to now.
    pub async fn mark_as_read(&self, conversation_id: &str) -> Result<()> {
        self.store
            .write(
                &self.read_marker_path(conversation_id),
                serde_json::json!({ "lastReadMs": crate::now_ms() }),
            )
            .await
    }

    /// Messages from peers newer than the local read marker.
    pub async fn unread_count(&self, conversation_id: &str) -> usize {
        let last_read_ms = match self.store.read(&self.read_marker_path(conversation_id)).await {
            Ok(Some(value)) => value["lastReadMs"].as_i64().unwrap_or(0),
            _ => 0,
        };
        self.collect(conversation_id, usize::MAX)
            .await
            .iter()
            .filter(|m| m.from != self.local && m.timestamp_ms > last_read_ms)
            .count()
    }
}

/// Shape of records written by older clients, before message ids.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecord {
    conversation_id: String,
    from: IdentityKey,
    to: IdentityKey,
    timestamp_ms: i64,
    ciphertext: String,
    #[serde(default)]
    delivered: bool,
}

/// Dedup-by-id accumulator shared by one-shot reads and live views.
struct MergeMap {
    records: HashMap<MessageId, StoredMessage>,
}

impl MergeMap {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// `true` when the candidate should replace the held record.
    fn more_complete(candidate: &StoredMessage, held: &StoredMessage) -> bool {
        candidate.delivered && !held.delivered
    }

    fn parse(value: Value) -> Option<StoredMessage> {
        if let Ok(message) = serde_json::from_value::<StoredMessage>(value.clone()) {
            return Some(message);
        }
        // Legacy compatibility only: records without an id dedup by a
        // timestamp+content derived key.
        match serde_json::from_value::<LegacyRecord>(value) {
            Ok(legacy) => Some(StoredMessage {
                id: legacy_id(legacy.timestamp_ms, &legacy.ciphertext),
                conversation_id: legacy.conversation_id,
                from: legacy.from,
                to: legacy.to,
                timestamp_ms: legacy.timestamp_ms,
                ciphertext: legacy.ciphertext,
                delivery_method: crate::messaging::message::DeliveryMethod::Relay,
                delivered: legacy.delivered,
            }),
            Err(e) => {
                debug!(error = %e, "skipping malformed history record");
                None
            }
        }
    }

    fn absorb(&mut self, value: Value) {
        self.absorb_new(value);
    }

    /// Absorb a record, returning it when it is new or an upgrade.
    fn absorb_new(&mut self, value: Value) -> Option<StoredMessage> {
        let message = Self::parse(value)?;
        match self.records.get(&message.id) {
            Some(held) if !Self::more_complete(&message, held) => None,
            _ => {
                self.records.insert(message.id, message.clone());
                Some(message)
            }
        }
    }

    fn into_sorted(self, limit: usize) -> Vec<StoredMessage> {
        let mut messages: Vec<StoredMessage> = self.records.into_values().collect();
        // Id tiebreak keeps equal-timestamp ordering identical on every
        // client regardless of map iteration order.
        messages.sort_by_key(|m| (m.timestamp_ms, m.id.0));
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        messages
    }
}

/// Deterministic id for legacy id-less records, stable across replicas.
fn legacy_id(timestamp_ms: i64, ciphertext: &str) -> MessageId {
    let mut hasher = Sha256::new();
    hasher.update(timestamp_ms.to_be_bytes());
    hasher.update(ciphertext.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    MessageId::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::{generate_message_id, DeliveryMethod};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn history(store: &MemoryStore, key: &str) -> ConversationHistory {
        ConversationHistory::new(Arc::new(store.clone()), IdentityKey::new(key))
    }

    fn message(cid: &str, from: &str, to: &str, ts: i64, delivered: bool) -> StoredMessage {
        StoredMessage {
            id: generate_message_id(),
            conversation_id: cid.into(),
            from: IdentityKey::new(from),
            to: IdentityKey::new(to),
            timestamp_ms: ts,
            ciphertext: format!("ct-{ts}"),
            delivery_method: DeliveryMethod::Direct,
            delivered,
        }
    }

    #[tokio::test]
    async fn test_merge_dedups_across_replicas() {
        let store = MemoryStore::new();
        let alice = history(&store, "alice-key");

        let msg = message("a|b", "alice-key", "bob-key", 100, false);
        alice.write_private(&msg).await.unwrap();
        alice.write_shared(&msg).await.unwrap();

        let merged = alice.collect("a|b", 50).await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, msg.id);
    }

    #[tokio::test]
    async fn test_delivered_copy_wins() {
        let store = MemoryStore::new();
        let alice = history(&store, "alice-key");

        let mut msg = message("a|b", "alice-key", "bob-key", 100, false);
        alice.write_private(&msg).await.unwrap();
        msg.delivered = true;
        alice.write_shared(&msg).await.unwrap();

        let merged = alice.collect("a|b", 50).await;
        assert_eq!(merged.len(), 1);
        assert!(merged[0].delivered);
    }

    #[tokio::test]
    async fn test_sorted_and_trimmed_to_most_recent() {
        let store = MemoryStore::new();
        let alice = history(&store, "alice-key");

        for ts in [300, 100, 200, 400] {
            alice
                .write_shared(&message("a|b", "alice-key", "bob-key", ts, true))
                .await
                .unwrap();
        }

        let merged = alice.collect("a|b", 2).await;
        let stamps: Vec<i64> = merged.iter().map(|m| m.timestamp_ms).collect();
        assert_eq!(stamps, vec![300, 400]);
    }

    #[tokio::test]
    async fn test_equal_timestamps_order_by_id() {
        let store = MemoryStore::new();
        let alice = history(&store, "alice-key");

        let mut low = message("a|b", "alice-key", "bob-key", 100, true);
        low.id = MessageId::from_bytes([1; 16]);
        let mut high = message("a|b", "bob-key", "alice-key", 100, true);
        high.id = MessageId::from_bytes([2; 16]);

        alice.write_shared(&high).await.unwrap();
        alice.write_shared(&low).await.unwrap();

        let merged = alice.collect("a|b", 50).await;
        let ids: Vec<MessageId> = merged.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![low.id, high.id]);
    }

    #[tokio::test]
    async fn test_tolerates_store_outage() {
        let store = MemoryStore::new();
        let alice = history(&store, "alice-key");
        store.set_unavailable(true);

        assert!(alice.collect("a|b", 50).await.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_records_dedup_by_timestamp_and_content() {
        let store = MemoryStore::new();
        let alice = history(&store, "alice-key");

        let legacy = json!({
            "conversationId": "a|b",
            "from": "bob-key",
            "to": "alice-key",
            "timestampMs": 100,
            "ciphertext": "old-wire-body",
            "delivered": true,
        });
        store
            .write("conversations/a|b/legacy-1", legacy.clone())
            .await
            .unwrap();
        store
            .write("users/alice-key/conversations/a|b/legacy-1", legacy)
            .await
            .unwrap();

        let merged = alice.collect("a|b", 50).await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].ciphertext, "old-wire-body");
    }

    #[tokio::test]
    async fn test_subscribe_merges_live_updates() {
        let store = MemoryStore::new();
        let alice = history(&store, "alice-key");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _watch = alice
            .subscribe("a|b", move |m| {
                seen2.lock().unwrap().push((m.id, m.delivered));
            })
            .await
            .unwrap();

        let mut msg = message("a|b", "bob-key", "alice-key", 100, false);
        alice.write_shared(&msg).await.unwrap();
        // Redundant copy in the private replica: no second delivery.
        alice.write_private(&msg).await.unwrap();
        // Delivery upgrade does fire again.
        msg.delivered = true;
        alice.write_shared(&msg).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(msg.id, false), (msg.id, true)]
        );
    }

    #[tokio::test]
    async fn test_unread_and_mark_as_read() {
        let store = MemoryStore::new();
        let alice = history(&store, "alice-key");

        let now = crate::now_ms();
        alice
            .write_shared(&message("a|b", "bob-key", "alice-key", now, true))
            .await
            .unwrap();
        // Own messages never count as unread.
        alice
            .write_shared(&message("a|b", "alice-key", "bob-key", now, true))
            .await
            .unwrap();

        assert_eq!(alice.unread_count("a|b").await, 1);

        alice.mark_as_read("a|b").await.unwrap();
        assert_eq!(alice.unread_count("a|b").await, 0);
    }
}
