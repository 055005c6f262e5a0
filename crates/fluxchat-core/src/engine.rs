//! The chat engine facade.
//!
//! One `ChatEngine` per client process, constructed with its store and
//! transport collaborators and the local identity keypair. No global
//! state: tests run several isolated engines against one shared
//! `MemoryStore` to simulate a fleet of clients.

use crate::connection::ConnectionState;
use crate::crypto::{PairCipher, StaticKeypair, X25519PublicKey};
use crate::error::{Error, Result};
use crate::identity::{FriendSet, Friendship, Identity, IdentityKey};
use crate::messaging::dispatcher::MessageDispatcher;
use crate::messaging::history::ConversationHistory;
use crate::messaging::inbox::InboxWorker;
use crate::messaging::typing::{TypingChannel, TypingWatch};
use crate::messaging::ChatMessage;
use crate::presence::{PresenceRecord, PresenceStatus, PresenceTracker};
use crate::store::{SharedStore, Subscription};
use crate::task::TaskHandle;
use crate::transport::DirectTransport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Events broadcast to UI observers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A message left the send path (direct or parked in the inbox).
    MessageSent(ChatMessage),
    /// A message arrived, direct or redelivered from the inbox.
    MessageReceived(ChatMessage),
    /// A peer's connection state changed.
    ConnectionChanged {
        /// The peer whose state changed.
        peer: IdentityKey,
        /// The new state.
        state: ConnectionState,
    },
    /// Repeated store failures; connectivity is degraded until the
    /// store recovers.
    Degraded,
}

/// Live merged view of one conversation. Dropping it stops history
/// delivery and the connection poller.
pub struct ConversationSubscription {
    _history: crate::messaging::HistoryWatch,
    _poller: Option<TaskHandle>,
}

struct Session {
    _inbox_task: TaskHandle,
}

/// The engine: presence, dispatch, history, inbox and typing behind one
/// authenticated surface.
pub struct ChatEngine {
    identity: Identity,
    transport: Arc<dyn DirectTransport>,
    friends: FriendSet,
    presence: Arc<PresenceTracker>,
    history: Arc<ConversationHistory>,
    typing: TypingChannel,
    dispatcher: Arc<MessageDispatcher>,
    inbox: Arc<InboxWorker>,
    events: broadcast::Sender<EngineEvent>,
    session: Mutex<Option<Session>>,
}

impl ChatEngine {
    /// Wire an engine from its collaborators and the local keypair.
    pub fn new(
        store: Arc<dyn SharedStore>,
        transport: Arc<dyn DirectTransport>,
        keypair: StaticKeypair,
        alias: impl Into<String>,
    ) -> Self {
        let key = IdentityKey::from_public(keypair.public_key());
        let identity = Identity {
            key: key.clone(),
            alias: alias.into(),
        };
        let cipher = Arc::new(PairCipher::new(keypair));
        let friends: FriendSet = Arc::new(RwLock::new(HashMap::new()));
        let (events, _) = broadcast::channel(64);

        let presence = Arc::new(PresenceTracker::new(store.clone(), key.clone()));
        let history = Arc::new(ConversationHistory::new(store.clone(), key.clone()));
        let typing = TypingChannel::new(store.clone(), key.clone());

        let sent_events = events.clone();
        let received_events = events.clone();
        let dispatcher = Arc::new(MessageDispatcher::new(
            store.clone(),
            key.clone(),
            cipher,
            friends.clone(),
            history.clone(),
            presence.clone(),
            transport.clone(),
            Arc::new(move |m| {
                let _ = sent_events.send(EngineEvent::MessageSent(m));
            }),
            Arc::new(move |m| {
                let _ = received_events.send(EngineEvent::MessageReceived(m));
            }),
        ));

        let redelivery_dispatcher = dispatcher.clone();
        let redelivery_events = events.clone();
        let degraded_events = events.clone();
        let inbox = Arc::new(InboxWorker::new(
            store,
            key,
            history.clone(),
            friends.clone(),
            Arc::new(move |m| {
                let view = redelivery_dispatcher.to_chat_message(m, true);
                let _ = redelivery_events.send(EngineEvent::MessageReceived(view));
            }),
            Arc::new(move || {
                let _ = degraded_events.send(EngineEvent::Degraded);
            }),
        ));

        Self {
            identity,
            transport,
            friends,
            presence,
            history,
            typing,
            dispatcher,
            inbox,
            events,
            session: Mutex::new(None),
        }
    }

    /// The local identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn require_auth(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .map_err(|_| Error::NotAuthenticated)?;
        if session.is_some() {
            Ok(())
        } else {
            Err(Error::NotAuthenticated)
        }
    }

    fn set_session(&self, session: Option<Session>) -> Option<Session> {
        match self.session.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, session),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), session),
        }
    }

    /// Start the authenticated session.
    ///
    /// Registers the direct-frame handler, publishes online presence and
    /// starts the inbox drain loop. Idempotent.
    pub async fn login(&self) -> Result<()> {
        if self.require_auth().is_ok() {
            return Ok(());
        }

        let dispatcher = self.dispatcher.clone();
        self.transport.set_message_handler(Box::new(move |_, frame| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.handle_incoming(&frame).await {
                    warn!(error = %e, "failed to handle direct frame");
                }
            });
        }));

        self.presence
            .publish(PresenceStatus::Online, self.transport.local_address())
            .await?;

        self.set_session(Some(Session {
            _inbox_task: self.inbox.spawn(),
        }));
        info!(alias = %self.identity.alias, "logged in");
        Ok(())
    }

    /// End the session: publish offline, stop every loop, drop every
    /// direct channel. Idempotent.
    pub async fn logout(&self) -> Result<()> {
        let Some(session) = self.set_session(None) else {
            return Ok(());
        };
        drop(session);

        self.transport.set_message_handler(Box::new(|_, _| {}));
        self.typing.cancel_pending();
        self.dispatcher.disconnect_all().await;
        self.presence.publish(PresenceStatus::Offline, None).await?;
        info!(alias = %self.identity.alias, "logged out");
        Ok(())
    }

    /// Observe engine events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Record a friendship with a peer.
    pub fn add_friend(
        &self,
        peer: IdentityKey,
        alias: impl Into<String>,
        encryption_key: Option<X25519PublicKey>,
    ) -> Friendship {
        let friendship = Friendship::new(&self.identity.key, peer.clone(), alias, encryption_key);
        if let Ok(mut friends) = self.friends.write() {
            friends.insert(peer, friendship.clone());
        }
        friendship
    }

    /// Snapshot of the friendship set.
    pub fn friends(&self) -> Vec<Friendship> {
        match self.friends.read() {
            Ok(friends) => friends.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Send a message to a friend. See
    /// [`MessageDispatcher::send`] for the delivery policy.
    pub async fn send_message(
        &self,
        recipient: &IdentityKey,
        text: &str,
    ) -> Result<ChatMessage> {
        self.require_auth()?;
        self.dispatcher.send(recipient, text).await
    }

    /// One-shot merged, decrypted history read.
    ///
    /// `was_offline` is a delivery-time fact, observable on the
    /// `MessageReceived` event; views built from stored records always
    /// report it `false`.
    pub async fn get_conversation_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Vec<ChatMessage> {
        self.history
            .collect(conversation_id, limit)
            .await
            .into_iter()
            .map(|m| self.dispatcher.to_chat_message(m, false))
            .collect()
    }

    /// Observe a conversation live. While subscribed, the peer's
    /// connection state is re-evaluated on a poll interval.
    pub async fn subscribe_to_conversation(
        &self,
        conversation_id: &str,
        callback: impl Fn(ChatMessage) + Send + Sync + 'static,
    ) -> Result<ConversationSubscription> {
        let dispatcher = self.dispatcher.clone();
        let watch = self
            .history
            .subscribe(conversation_id, move |m| {
                callback(dispatcher.to_chat_message(m, false));
            })
            .await?;

        let poller = self
            .conversation_peer(conversation_id)
            .map(|peer| self.monitor(&peer).spawn_poller());

        Ok(ConversationSubscription {
            _history: watch,
            _poller: poller,
        })
    }

    fn conversation_peer(&self, conversation_id: &str) -> Option<IdentityKey> {
        let friends = self.friends.read().ok()?;
        friends
            .values()
            .find(|f| f.conversation_id == conversation_id)
            .map(|f| f.peer.clone())
    }

    fn monitor(&self, peer: &IdentityKey) -> Arc<crate::connection::ConnectionMonitor> {
        let monitor = self.dispatcher.monitor_for(peer);
        let events = self.events.clone();
        monitor.set_on_change(Box::new(move |peer, state| {
            let _ = events.send(EngineEvent::ConnectionChanged {
                peer: peer.clone(),
                state: state.clone(),
            });
        }));
        monitor
    }

    /// Mark a conversation read up to now.
    pub async fn mark_as_read(&self, conversation_id: &str) -> Result<()> {
        self.require_auth()?;
        self.history.mark_as_read(conversation_id).await
    }

    /// Unread messages from peers in a conversation.
    pub async fn unread_count(&self, conversation_id: &str) -> usize {
        self.history.unread_count(conversation_id).await
    }

    /// Publish the local user's presence. The transport address is
    /// advertised while online, withheld otherwise.
    pub async fn update_presence(&self, status: PresenceStatus) -> Result<()> {
        self.require_auth()?;
        let address = match status {
            PresenceStatus::Online => self.transport.local_address(),
            _ => None,
        };
        self.presence.publish(status, address).await
    }

    /// One-shot presence read, defaulting to offline.
    pub async fn get_presence(&self, key: &IdentityKey) -> PresenceRecord {
        self.presence.get(key).await
    }

    /// Observe a peer's presence updates.
    pub async fn subscribe_to_presence(
        &self,
        key: &IdentityKey,
        callback: impl Fn(PresenceRecord) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.presence.subscribe(key, callback).await
    }

    /// Publish the local user's typing state for a conversation.
    pub async fn send_typing_indicator(
        &self,
        conversation_id: &str,
        is_typing: bool,
    ) -> Result<()> {
        self.require_auth()?;
        self.typing.set_typing(conversation_id, is_typing).await
    }

    /// Observe effective typing state in a conversation.
    pub async fn subscribe_to_typing(
        &self,
        conversation_id: &str,
        callback: impl Fn(&IdentityKey, bool) + Send + Sync + 'static,
    ) -> Result<TypingWatch> {
        self.typing.subscribe(conversation_id, callback).await
    }

    /// Explicitly attempt a direct connection to a peer.
    ///
    /// Returns whether a live direct channel is available afterwards.
    pub async fn attempt_direct_connection(&self, peer: &IdentityKey) -> Result<bool> {
        self.require_auth()?;
        Ok(self.monitor(peer).attempt_direct().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::MemoryHub;

    fn engine(store: &MemoryStore, hub: &MemoryHub, address: &str, alias: &str) -> ChatEngine {
        ChatEngine::new(
            Arc::new(store.clone()),
            Arc::new(hub.endpoint(address)),
            StaticKeypair::generate(),
            alias,
        )
    }

    fn befriend(a: &ChatEngine, b: &ChatEngine) {
        a.add_friend(
            b.identity().key.clone(),
            b.identity().alias.clone(),
            b.identity().key.to_public(),
        );
        b.add_friend(
            a.identity().key.clone(),
            a.identity().alias.clone(),
            a.identity().key.to_public(),
        );
    }

    #[tokio::test]
    async fn test_operations_require_login() {
        let store = MemoryStore::new();
        let hub = MemoryHub::new();
        let alice = engine(&store, &hub, "addr-alice", "Alice");
        let bob_key = IdentityKey::new("bob-key");

        assert!(matches!(
            alice.send_message(&bob_key, "hi").await,
            Err(Error::NotAuthenticated)
        ));
        assert!(matches!(
            alice.update_presence(PresenceStatus::Away).await,
            Err(Error::NotAuthenticated)
        ));
        assert!(matches!(
            alice.attempt_direct_connection(&bob_key).await,
            Err(Error::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_login_publishes_online_with_address() {
        let store = MemoryStore::new();
        let hub = MemoryHub::new();
        let alice = engine(&store, &hub, "addr-alice", "Alice");
        let bob = engine(&store, &hub, "addr-bob", "Bob");

        alice.login().await.unwrap();

        let record = bob.get_presence(&alice.identity().key).await;
        assert_eq!(record.status, PresenceStatus::Online);
        assert_eq!(record.transport_address.as_deref(), Some("addr-alice"));
        assert!(record.is_online(crate::now_ms()));
    }

    #[tokio::test]
    async fn test_logout_publishes_offline() {
        let store = MemoryStore::new();
        let hub = MemoryHub::new();
        let alice = engine(&store, &hub, "addr-alice", "Alice");
        let bob = engine(&store, &hub, "addr-bob", "Bob");

        alice.login().await.unwrap();
        alice.logout().await.unwrap();

        let record = bob.get_presence(&alice.identity().key).await;
        assert_eq!(record.status, PresenceStatus::Offline);
        assert!(matches!(
            alice.send_message(&bob.identity().key, "hi").await,
            Err(Error::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_send_emits_event_and_history() {
        let store = MemoryStore::new();
        let hub = MemoryHub::new();
        let alice = engine(&store, &hub, "addr-alice", "Alice");
        let bob = engine(&store, &hub, "addr-bob", "Bob");
        befriend(&alice, &bob);

        alice.login().await.unwrap();
        let mut events = alice.subscribe_events();

        let sent = alice
            .send_message(&bob.identity().key, "hi Bob")
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            EngineEvent::MessageSent(m) => assert_eq!(m.id, sent.id),
            other => panic!("unexpected event: {other:?}"),
        }

        let history = alice
            .get_conversation_history(&sent.conversation_id, 50)
            .await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "hi Bob");
        assert!(!history[0].undecryptable);
    }

    #[tokio::test]
    async fn test_history_decrypts_own_sends() {
        let store = MemoryStore::new();
        let hub = MemoryHub::new();
        let alice = engine(&store, &hub, "addr-alice", "Alice");
        let bob = engine(&store, &hub, "addr-bob", "Bob");
        befriend(&alice, &bob);

        alice.login().await.unwrap();
        let sent = alice
            .send_message(&bob.identity().key, "secret")
            .await
            .unwrap();

        // The stored body is sealed; the read-back view is decrypted.
        let stored = store
            .read(&format!(
                "conversations/{}/{}",
                sent.conversation_id, sent.id
            ))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stored["ciphertext"], "secret");

        let history = alice
            .get_conversation_history(&sent.conversation_id, 10)
            .await;
        assert_eq!(history[0].text, "secret");
    }

    #[tokio::test]
    async fn test_typing_through_facade() {
        let store = MemoryStore::new();
        let hub = MemoryHub::new();
        let alice = engine(&store, &hub, "addr-alice", "Alice");
        let bob = engine(&store, &hub, "addr-bob", "Bob");
        befriend(&alice, &bob);
        alice.login().await.unwrap();

        let cid = crate::identity::conversation_id(
            &alice.identity().key,
            &bob.identity().key,
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _watch = bob
            .subscribe_to_typing(&cid, move |key, typing| {
                seen2.lock().unwrap().push((key.clone(), typing));
            })
            .await
            .unwrap();

        alice.send_typing_indicator(&cid, true).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, alice.identity().key);
        assert!(seen[0].1);
    }
}
