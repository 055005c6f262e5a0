//! End-to-end delivery scenarios over in-process store and transport.

use fluxchat_core::crypto::StaticKeypair;
use fluxchat_core::engine::{ChatEngine, EngineEvent};
use fluxchat_core::identity::conversation_id;
use fluxchat_core::messaging::DeliveryMethod;
use fluxchat_core::presence::PresenceStatus;
use fluxchat_core::store::{MemoryStore, SharedStore};
use fluxchat_core::transport::MemoryHub;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn engine(store: &MemoryStore, hub: &MemoryHub, address: &str, alias: &str) -> ChatEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
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

/// Alice online, Bob offline: the message is parked in Bob's inbox and
/// appears in Alice's history immediately.
#[tokio::test]
async fn offline_recipient_message_parked_in_inbox() {
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let alice = engine(&store, &hub, "addr-alice", "Alice");
    let bob = engine(&store, &hub, "addr-bob", "Bob");
    befriend(&alice, &bob);

    alice.login().await.unwrap();
    let sent = alice
        .send_message(&bob.identity().key, "hi Bob")
        .await
        .unwrap();

    assert_eq!(sent.delivery_method, DeliveryMethod::Relay);
    assert!(!sent.delivered);

    let entries = store
        .list(&format!("inbox/{}", bob.identity().key))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1["deliveryMethod"], "relay");
    assert_eq!(entries[0].1["delivered"], false);

    let history = alice
        .get_conversation_history(&sent.conversation_id, 50)
        .await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "hi Bob");
}

/// Bob logs in: within one poll interval the inbox entry is consumed,
/// his history shows the message delivered, and nothing is left to
/// redeliver.
#[tokio::test(start_paused = true)]
async fn redelivery_on_login_within_one_poll() {
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let alice = engine(&store, &hub, "addr-alice", "Alice");
    let bob = engine(&store, &hub, "addr-bob", "Bob");
    befriend(&alice, &bob);
    let cid = conversation_id(&alice.identity().key, &bob.identity().key);

    alice.login().await.unwrap();
    alice
        .send_message(&bob.identity().key, "hi Bob")
        .await
        .unwrap();

    bob.login().await.unwrap();
    let mut events = bob.subscribe_events();

    tokio::time::sleep(Duration::from_secs(6)).await;

    let history = bob.get_conversation_history(&cid, 50).await;
    assert_eq!(history.len(), 1);
    assert!(history[0].delivered);
    assert_eq!(history[0].text, "hi Bob");

    match events.try_recv().unwrap() {
        EngineEvent::MessageReceived(m) => {
            assert!(m.was_offline);
            assert!(m.delivered);
            assert_eq!(m.text, "hi Bob");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Entry retired: the next poll finds nothing.
    assert!(store
        .list(&format!("inbox/{}", bob.identity().key))
        .await
        .unwrap()
        .is_empty());
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(bob.get_conversation_history(&cid, 50).await.len(), 1);
}

/// Both online with a successful handshake: direct delivery, delivered
/// immediately, and no inbox entry is ever created.
#[tokio::test]
async fn online_recipient_delivered_direct() {
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let alice = engine(&store, &hub, "addr-alice", "Alice");
    let bob = engine(&store, &hub, "addr-bob", "Bob");
    befriend(&alice, &bob);

    bob.login().await.unwrap();
    alice.login().await.unwrap();
    let mut bob_events = bob.subscribe_events();

    let sent = alice
        .send_message(&bob.identity().key, "hi Bob")
        .await
        .unwrap();
    assert_eq!(sent.delivery_method, DeliveryMethod::Direct);
    assert!(sent.delivered);

    assert!(store
        .list(&format!("inbox/{}", bob.identity().key))
        .await
        .unwrap()
        .is_empty());

    match bob_events.recv().await.unwrap() {
        EngineEvent::MessageReceived(m) => {
            assert_eq!(m.text, "hi Bob");
            assert!(!m.was_offline);
            assert!(!m.undecryptable);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Both sides converge on one delivered history entry.
    let cid = conversation_id(&alice.identity().key, &bob.identity().key);
    let bob_history = bob.get_conversation_history(&cid, 50).await;
    assert_eq!(bob_history.len(), 1);
    assert!(bob_history[0].delivered);
}

/// Carol sets typing once and never renews: subscribers see it active
/// shortly after, and stale a few seconds later even though her
/// auto-clear write never reached the store.
#[tokio::test(start_paused = true)]
async fn stale_typing_signal_expires_for_readers() {
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let carol = engine(&store, &hub, "addr-carol", "Carol");
    let dave = engine(&store, &hub, "addr-dave", "Dave");
    befriend(&carol, &dave);
    let cid = conversation_id(&carol.identity().key, &dave.identity().key);

    carol.login().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let _watch = dave
        .subscribe_to_typing(&cid, move |key, typing| {
            seen2.lock().unwrap().push((key.clone(), typing));
        })
        .await
        .unwrap();

    carol.send_typing_indicator(&cid, true).await.unwrap();
    // Logout cancels the pending auto-clear, simulating a client that
    // vanished mid-typing.
    carol.logout().await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        seen.lock().unwrap().last(),
        Some(&(carol.identity().key.clone(), true))
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        seen.lock().unwrap().last(),
        Some(&(carol.identity().key.clone(), false))
    );
}

/// Presence windowing end to end: logout flips the peer to offline and
/// sends fall back to the inbox.
#[tokio::test]
async fn logout_downgrades_delivery_to_inbox() {
    let store = MemoryStore::new();
    let hub = MemoryHub::new();
    let alice = engine(&store, &hub, "addr-alice", "Alice");
    let bob = engine(&store, &hub, "addr-bob", "Bob");
    befriend(&alice, &bob);

    bob.login().await.unwrap();
    alice.login().await.unwrap();

    let first = alice
        .send_message(&bob.identity().key, "while online")
        .await
        .unwrap();
    assert_eq!(first.delivery_method, DeliveryMethod::Direct);

    bob.logout().await.unwrap();
    let record = alice.get_presence(&bob.identity().key).await;
    assert_eq!(record.status, PresenceStatus::Offline);

    let second = alice
        .send_message(&bob.identity().key, "while offline")
        .await
        .unwrap();
    assert_eq!(second.delivery_method, DeliveryMethod::Relay);
    assert_eq!(
        store
            .list(&format!("inbox/{}", bob.identity().key))
            .await
            .unwrap()
            .len(),
        1
    );
}
