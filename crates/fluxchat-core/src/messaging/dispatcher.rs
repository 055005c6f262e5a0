//! Adaptive message dispatch.
//!
//! The send path prefers the low-latency direct transport and degrades
//! to the durable offline inbox, never surfacing transport failures to
//! the caller. Side effects are append-only: whichever path runs, the
//! message is dual-written to the sender's private log and the shared
//! conversation log, so the history merge sees it from either replica.

use crate::connection::ConnectionMonitor;
use crate::crypto::PairCipher;
use crate::error::{Error, Result};
use crate::identity::{FriendSet, Friendship, IdentityKey};
use crate::logging::RedactedKey;
use crate::messaging::history::ConversationHistory;
use crate::messaging::inbox;
use crate::messaging::message::{
    generate_message_id, ChatMessage, DeliveryMethod, StoredMessage,
};
use crate::presence::PresenceTracker;
use crate::store::SharedStore;
use crate::transport::DirectTransport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Callback fired once per dispatched or received message.
pub type MessageCallback = Arc<dyn Fn(ChatMessage) + Send + Sync>;

/// Routes outbound messages and handles inbound direct frames.
pub struct MessageDispatcher {
    store: Arc<dyn SharedStore>,
    local: IdentityKey,
    cipher: Arc<PairCipher>,
    friends: FriendSet,
    history: Arc<ConversationHistory>,
    presence: Arc<PresenceTracker>,
    transport: Arc<dyn DirectTransport>,
    monitors: Mutex<HashMap<IdentityKey, Arc<ConnectionMonitor>>>,
    on_sent: MessageCallback,
    on_received: MessageCallback,
}

impl MessageDispatcher {
    /// Wire a dispatcher for the authenticated identity.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SharedStore>,
        local: IdentityKey,
        cipher: Arc<PairCipher>,
        friends: FriendSet,
        history: Arc<ConversationHistory>,
        presence: Arc<PresenceTracker>,
        transport: Arc<dyn DirectTransport>,
        on_sent: MessageCallback,
        on_received: MessageCallback,
    ) -> Self {
        Self {
            store,
            local,
            cipher,
            friends,
            history,
            presence,
            transport,
            monitors: Mutex::new(HashMap::new()),
            on_sent,
            on_received,
        }
    }

    fn friendship(&self, peer: &IdentityKey) -> Option<Friendship> {
        self.friends.read().ok()?.get(peer).cloned()
    }

    /// The connection monitor for a peer, created lazily.
    pub fn monitor_for(&self, peer: &IdentityKey) -> Arc<ConnectionMonitor> {
        let mut monitors = match self.monitors.lock() {
            Ok(monitors) => monitors,
            Err(poisoned) => poisoned.into_inner(),
        };
        monitors
            .entry(peer.clone())
            .or_insert_with(|| {
                Arc::new(ConnectionMonitor::new(
                    peer.clone(),
                    self.presence.clone(),
                    self.transport.clone(),
                ))
            })
            .clone()
    }

    /// Drop all connection monitors (logout).
    pub async fn disconnect_all(&self) {
        let monitors: Vec<Arc<ConnectionMonitor>> = {
            let mut map = match self.monitors.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.drain().map(|(_, m)| m).collect()
        };
        for monitor in monitors {
            monitor.disconnect().await;
        }
    }

    fn seal_body(&self, friendship: &Friendship, text: &str) -> String {
        match &friendship.encryption_key {
            Some(key) => match self.cipher.seal(text, key) {
                Ok(sealed) => sealed,
                Err(e) => {
                    // Degrade rather than fail the send. The recipient
                    // still gets the message, unencrypted.
                    warn!(
                        peer = %RedactedKey(friendship.peer.as_str()),
                        error = %e,
                        "encryption failed, sending plaintext"
                    );
                    text.to_string()
                }
            },
            None => {
                warn!(
                    peer = %RedactedKey(friendship.peer.as_str()),
                    "no encryption key for peer, sending plaintext"
                );
                text.to_string()
            }
        }
    }

    fn open_body(&self, peer: &IdentityKey, ciphertext: &str) -> (String, bool) {
        let key = self
            .friendship(peer)
            .and_then(|friendship| friendship.encryption_key);
        match key {
            Some(key) => match self.cipher.open(ciphertext, &key) {
                Ok(text) => (text, false),
                Err(e) => {
                    // Best-effort display: surface the raw body, flagged.
                    debug!(peer = %RedactedKey(peer.as_str()), error = %e, "message body undecryptable");
                    (ciphertext.to_string(), true)
                }
            },
            // Plaintext-fallback peers store the body as-is.
            None => (ciphertext.to_string(), false),
        }
    }

    /// The UI-facing view of a stored record, decrypted best-effort.
    pub fn to_chat_message(&self, message: StoredMessage, was_offline: bool) -> ChatMessage {
        let peer = if message.from == self.local {
            &message.to
        } else {
            &message.from
        };
        let (text, undecryptable) = self.open_body(peer, &message.ciphertext);
        ChatMessage {
            id: message.id,
            conversation_id: message.conversation_id,
            from: message.from,
            to: message.to,
            timestamp_ms: message.timestamp_ms,
            text,
            delivery_method: message.delivery_method,
            delivered: message.delivered,
            was_offline,
            undecryptable,
        }
    }

    /// Send a message to a friend.
    ///
    /// Tries the direct transport when presence allows it, falls back to
    /// the recipient's offline inbox otherwise. Transport failures are
    /// absorbed; only authorization and store failures reach the caller.
    pub async fn send(&self, recipient: &IdentityKey, text: &str) -> Result<ChatMessage> {
        let friendship = self
            .friendship(recipient)
            .ok_or_else(|| Error::NotFriend(recipient.to_string()))?;

        let mut message = StoredMessage {
            id: generate_message_id(),
            conversation_id: friendship.conversation_id.clone(),
            from: self.local.clone(),
            to: recipient.clone(),
            timestamp_ms: crate::now_ms(),
            ciphertext: self.seal_body(&friendship, text),
            delivery_method: DeliveryMethod::Direct,
            delivered: true,
        };

        let monitor = self.monitor_for(recipient);
        let mut delivered_direct = false;
        if monitor.attempt_direct().await {
            let frame = serde_json::to_vec(&message)?;
            match monitor.send_direct(&frame).await {
                Ok(()) => {
                    delivered_direct = true;
                    info!(id = %message.id, "message delivered direct");
                }
                Err(e) => {
                    debug!(id = %message.id, error = %e, "direct send failed, using inbox");
                }
            }
        }

        if !delivered_direct {
            message.delivery_method = DeliveryMethod::Relay;
            message.delivered = false;
            inbox::enqueue(&self.store, &message).await?;
            info!(id = %message.id, "message parked in offline inbox");
        }

        // Explicit two-destination write; the history merge depends on
        // the record reaching both replicas.
        self.history.write_private(&message).await?;
        self.history.write_shared(&message).await?;

        let view = ChatMessage {
            id: message.id,
            conversation_id: message.conversation_id,
            from: message.from,
            to: message.to,
            timestamp_ms: message.timestamp_ms,
            text: text.to_string(),
            delivery_method: message.delivery_method,
            delivered: message.delivered,
            was_offline: false,
            undecryptable: false,
        };
        (self.on_sent)(view.clone());
        Ok(view)
    }

    /// Handle one frame received over the direct transport.
    ///
    /// Non-friend senders are logged and dropped; duplicate ids are
    /// absorbed by the history dedup. No inbox entry is ever created for
    /// direct deliveries.
    pub async fn handle_incoming(&self, frame: &[u8]) -> Result<()> {
        let message: StoredMessage = serde_json::from_slice(frame)?;

        if self.friendship(&message.from).is_none() {
            warn!(
                from = %RedactedKey(message.from.as_str()),
                error = %Error::UntrustedSender(message.from.to_string()),
                "dropping direct message from non-friend"
            );
            return Ok(());
        }

        let mut delivered = message;
        delivered.delivered = true;

        if self
            .history
            .contains(&delivered.conversation_id, &delivered.id)
            .await
        {
            debug!(id = %delivered.id, "duplicate direct delivery ignored");
            return Ok(());
        }

        self.history.write_private(&delivered).await?;
        // Also flips the shared record to delivered for the sender.
        self.history.write_shared(&delivered).await?;

        (self.on_received)(self.to_chat_message(delivered, false));
        Ok(())
    }
}
