//! Presence and push flow tests.
//!
//! Exercises connect, push, offline replay and disconnect end to end against
//! the in-memory broker and an in-process friend graph. No external services.
//!
//! Run: cargo test --test presence_flow_test

use std::collections::HashSet;
use std::sync::Arc;

use presence_push_service::config::DeviceLimitConfig;
use presence_push_service::error::AppError;
use presence_push_service::models::{
    DeviceCategory, FriendStatus, Payload, PresenceStatus, WsEvent, WsMsg,
};
use async_trait::async_trait;
use presence_push_service::services::{
    AesGcmEncryptor, EncryptionGate, Encryptor, MemoryBroker, OfflineQueue, PresenceEngine,
    PushDispatcher, PushOutcome, RelationService, StaticRelations, TaskGroup,
};
use presence_push_service::websocket::{Connection, ConnectionRegistry, Frame};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// Relation service that is always unreachable.
struct RelationsDown;

#[async_trait]
impl RelationService for RelationsDown {
    async fn get_friend_list(&self, _user_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        Err(AppError::Relation("connection refused".into()))
    }
}

/// Seals like the real encryptor, except for one recipient with no usable
/// key material.
struct RefuseRecipient {
    inner: Arc<AesGcmEncryptor>,
    refused: Option<Uuid>,
}

#[async_trait]
impl Encryptor for RefuseRecipient {
    async fn seal(&self, plaintext: &[u8], recipient: Uuid) -> Result<Vec<u8>, AppError> {
        if self.refused == Some(recipient) {
            return Err(AppError::Encryption("no key material for recipient".into()));
        }
        self.inner.seal(plaintext, recipient).await
    }

    async fn unseal(&self, sealed: &[u8], recipient: Uuid) -> Result<Vec<u8>, AppError> {
        self.inner.unseal(sealed, recipient).await
    }
}

struct Harness {
    registry: ConnectionRegistry,
    presence: PresenceEngine,
    dispatcher: PushDispatcher,
    queue: OfflineQueue,
    encryptor: Arc<AesGcmEncryptor>,
    tasks: TaskGroup,
}

impl Harness {
    fn new(relations: StaticRelations, device_limit: DeviceLimitConfig) -> Self {
        Self::build(Arc::new(relations), device_limit, None)
    }

    fn build(
        relations: Arc<dyn RelationService>,
        device_limit: DeviceLimitConfig,
        refused: Option<Uuid>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let encryptor = Arc::new(AesGcmEncryptor::new([42u8; 32]));
        let gate = EncryptionGate::new(Arc::new(RefuseRecipient {
            inner: encryptor.clone(),
            refused,
        }));
        let queue = OfflineQueue::new(Arc::new(MemoryBroker::new()), "offline:queue");
        let tasks = TaskGroup::new(64);
        let dispatcher =
            PushDispatcher::new(registry.clone(), gate.clone(), queue.clone(), tasks.clone());
        let presence = PresenceEngine::new(
            registry.clone(),
            dispatcher.clone(),
            gate,
            queue.clone(),
            relations,
            device_limit,
            tasks.clone(),
        );
        Self {
            registry,
            presence,
            dispatcher,
            queue,
            encryptor,
            tasks,
        }
    }

    /// Everything received so far on one session, decrypted.
    async fn received(&self, user_id: Uuid, frames: &mut UnboundedReceiver<Frame>) -> Vec<WsMsg> {
        self.tasks.wait_idle().await;
        let mut msgs = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            let plain = self
                .encryptor
                .unseal(&frame, user_id)
                .await
                .expect("frame sealed for another recipient");
            msgs.push(serde_json::from_slice(&plain).expect("frame is not a WsMsg"));
        }
        msgs
    }
}

fn chat(user_id: Uuid, text: &str) -> WsMsg {
    WsMsg::new(
        user_id,
        WsEvent::SendUserMessage,
        Payload::from(json!({ "text": text })),
    )
}

#[tokio::test]
async fn test_offline_push_is_replayed_on_connect() {
    let h = Harness::new(StaticRelations::new(), DeviceLimitConfig::unlimited());
    let alice = Uuid::new_v4();

    let outcome = h
        .dispatcher
        .push_one(chat(alice, "hi").with_push_offline(true))
        .await
        .unwrap();
    assert_eq!(outcome, PushOutcome::Queued);
    assert_eq!(h.queue.pending(alice).await.unwrap(), 1);

    let mut session = h
        .presence
        .on_connect(alice, "web", DeviceCategory::Web)
        .await
        .unwrap();
    let msgs = h.received(alice, &mut session.frames).await;

    let replayed: Vec<_> = msgs
        .iter()
        .filter(|m| m.event == WsEvent::SendUserMessage)
        .collect();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].payload.decode::<serde_json::Value>().unwrap()["text"], "hi");
    assert!(!h.queue.exists(alice).await.unwrap());
}

#[tokio::test]
async fn test_offline_replay_keeps_fifo_order() {
    let h = Harness::new(StaticRelations::new(), DeviceLimitConfig::unlimited());
    let alice = Uuid::new_v4();

    for text in ["one", "two", "three"] {
        h.dispatcher
            .push_one(chat(alice, text).with_push_offline(true))
            .await
            .unwrap();
    }

    let mut session = h
        .presence
        .on_connect(alice, "web", DeviceCategory::Web)
        .await
        .unwrap();
    let texts: Vec<serde_json::Value> = h
        .received(alice, &mut session.frames)
        .await
        .into_iter()
        .filter(|m| m.event == WsEvent::SendUserMessage)
        .map(|m| m.payload.decode::<serde_json::Value>().unwrap()["text"].clone())
        .collect();

    assert_eq!(texts, vec![json!("one"), json!("two"), json!("three")]);
    assert!(!h.queue.exists(alice).await.unwrap());
}

#[tokio::test]
async fn test_push_reaches_every_live_session_without_queueing() {
    let h = Harness::new(StaticRelations::new(), DeviceLimitConfig::unlimited());
    let alice = Uuid::new_v4();

    let mut web = h
        .presence
        .on_connect(alice, "web", DeviceCategory::Web)
        .await
        .unwrap();
    let mut mobile = h
        .presence
        .on_connect(alice, "mobile", DeviceCategory::Mobile)
        .await
        .unwrap();
    // Discard the connect handshake traffic.
    h.received(alice, &mut web.frames).await;
    h.received(alice, &mut mobile.frames).await;

    let outcome = h
        .dispatcher
        .push_one(chat(alice, "x").with_push_offline(true))
        .await
        .unwrap();
    assert_eq!(outcome, PushOutcome::Delivered { sessions: 2 });

    for frames in [&mut web.frames, &mut mobile.frames] {
        let msgs = h.received(alice, frames).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload.decode::<serde_json::Value>().unwrap()["text"], "x");
    }
    assert!(!h.queue.exists(alice).await.unwrap());
}

#[tokio::test]
async fn test_push_to_offline_user_without_flag_is_dropped() {
    let h = Harness::new(StaticRelations::new(), DeviceLimitConfig::unlimited());
    let alice = Uuid::new_v4();

    let outcome = h.dispatcher.push_one(chat(alice, "gone")).await.unwrap();

    assert_eq!(outcome, PushOutcome::Dropped);
    assert!(!h.queue.exists(alice).await.unwrap());
}

#[tokio::test]
async fn test_device_limit_rejects_second_session() {
    let h = Harness::new(StaticRelations::new(), DeviceLimitConfig::max(1));
    let alice = Uuid::new_v4();

    let _first = h
        .presence
        .on_connect(alice, "web", DeviceCategory::Web)
        .await
        .unwrap();
    let rejected = h
        .presence
        .on_connect(alice, "web-2", DeviceCategory::Web)
        .await;

    assert!(matches!(
        rejected,
        Err(AppError::DeviceLimitExceeded { max: 1 })
    ));
    assert_eq!(
        h.registry
            .count_live_sessions(DeviceCategory::Web, alice)
            .await,
        1
    );
}

#[tokio::test]
async fn test_friend_sees_online_then_offline() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let h = Harness::new(
        StaticRelations::new().befriend(alice, bob),
        DeviceLimitConfig::unlimited(),
    );

    let mut bob_session = h
        .presence
        .on_connect(bob, "bob-web", DeviceCategory::Web)
        .await
        .unwrap();
    h.received(bob, &mut bob_session.frames).await;

    let alice_session = h
        .presence
        .on_connect(alice, "alice-phone", DeviceCategory::Mobile)
        .await
        .unwrap();
    let msgs = h.received(bob, &mut bob_session.frames).await;
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].event, WsEvent::FriendOnlineStatusChanged);
    assert_eq!(
        msgs[0].payload.decode::<FriendStatus>().unwrap(),
        FriendStatus {
            user_id: alice,
            status: PresenceStatus::Online
        }
    );

    assert!(h.presence.on_disconnect(alice_session.key).await);
    let msgs = h.received(bob, &mut bob_session.frames).await;
    assert_eq!(msgs.len(), 1);
    assert_eq!(
        msgs[0].payload.decode::<FriendStatus>().unwrap(),
        FriendStatus {
            user_id: alice,
            status: PresenceStatus::Offline
        }
    );
}

#[tokio::test]
async fn test_offline_announced_only_after_last_session() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let h = Harness::new(
        StaticRelations::new().befriend(alice, bob),
        DeviceLimitConfig::unlimited(),
    );

    let mut bob_session = h
        .presence
        .on_connect(bob, "bob-web", DeviceCategory::Web)
        .await
        .unwrap();
    let web = h
        .presence
        .on_connect(alice, "alice-web", DeviceCategory::Web)
        .await
        .unwrap();
    let desktop = h
        .presence
        .on_connect(alice, "alice-desktop", DeviceCategory::Desktop)
        .await
        .unwrap();
    h.received(bob, &mut bob_session.frames).await;

    assert!(!h.presence.on_disconnect(web.key).await);
    assert!(h.received(bob, &mut bob_session.frames).await.is_empty());

    assert!(h.presence.on_disconnect(desktop.key).await);
    let msgs = h.received(bob, &mut bob_session.frames).await;
    assert_eq!(msgs.len(), 1);
    assert_eq!(
        msgs[0].payload.decode::<FriendStatus>().unwrap().status,
        PresenceStatus::Offline
    );
}

#[tokio::test]
async fn test_batch_continues_past_failed_entries() {
    let blocked = Uuid::new_v4();
    let h = Harness::build(
        Arc::new(StaticRelations::new()),
        DeviceLimitConfig::unlimited(),
        Some(blocked),
    );
    let offline = Uuid::new_v4();

    let report = h
        .dispatcher
        .push_batch(vec![
            chat(blocked, "fails").with_push_offline(true),
            chat(offline, "queued").with_push_offline(true),
            chat(offline, "dropped"),
        ])
        .await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.queued, 1);
    assert_eq!(report.dropped, 1);
    assert!(report.last_error.is_some());
    assert_eq!(h.queue.pending(offline).await.unwrap(), 1);
    // Nothing unsealed was persisted for the failed recipient.
    assert!(!h.queue.exists(blocked).await.unwrap());
}

#[tokio::test]
async fn test_relation_outage_does_not_block_connect() {
    let h = Harness::build(Arc::new(RelationsDown), DeviceLimitConfig::unlimited(), None);
    let alice = Uuid::new_v4();
    h.dispatcher
        .push_one(chat(alice, "hi").with_push_offline(true))
        .await
        .unwrap();

    let mut session = h
        .presence
        .on_connect(alice, "web", DeviceCategory::Web)
        .await
        .unwrap();
    assert_eq!(
        h.registry.count_live_sessions(DeviceCategory::Web, alice).await,
        1
    );

    let msgs = h.received(alice, &mut session.frames).await;
    let events: Vec<WsEvent> = msgs.iter().map(|m| m.event).collect();
    assert_eq!(
        events,
        vec![
            WsEvent::Online,
            WsEvent::BulkFriendOnlineStatus,
            WsEvent::SendUserMessage
        ]
    );
    assert!(msgs[1].payload.decode::<Vec<FriendStatus>>().unwrap().is_empty());
    assert_eq!(msgs[2].payload.decode::<serde_json::Value>().unwrap()["text"], "hi");
    assert!(!h.queue.exists(alice).await.unwrap());

    assert!(h.presence.on_disconnect(session.key).await);
    h.tasks.wait_idle().await;
    assert!(!h.registry.is_online(alice).await);
}

#[tokio::test]
async fn test_status_sealing_failure_does_not_block_connect() {
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let h = Harness::build(
        Arc::new(StaticRelations::new().befriend(alice, bob)),
        DeviceLimitConfig::unlimited(),
        Some(bob),
    );
    let mut bob_session = h
        .presence
        .on_connect(bob, "bob-web", DeviceCategory::Web)
        .await
        .unwrap();
    // Bob's own announcement to still-offline alice is dropped.
    h.tasks.wait_idle().await;
    h.dispatcher
        .push_one(chat(alice, "hi").with_push_offline(true))
        .await
        .unwrap();

    let mut session = h
        .presence
        .on_connect(alice, "alice-web", DeviceCategory::Web)
        .await
        .unwrap();
    let msgs = h.received(alice, &mut session.frames).await;

    assert_eq!(msgs[0].event, WsEvent::Online);
    assert_eq!(
        msgs[1].payload.decode::<Vec<FriendStatus>>().unwrap(),
        vec![FriendStatus {
            user_id: bob,
            status: PresenceStatus::Online
        }]
    );
    assert_eq!(msgs[2].payload.decode::<serde_json::Value>().unwrap()["text"], "hi");
    assert!(!h.queue.exists(alice).await.unwrap());
    // Nothing could be sealed for bob, so nothing reached him.
    assert!(bob_session.frames.try_recv().is_err());

    assert!(h.presence.on_disconnect(session.key).await);
    h.tasks.wait_idle().await;
}

#[tokio::test]
async fn test_sealing_is_recipient_specific() {
    let encryptor = AesGcmEncryptor::new([1u8; 32]);
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let for_alice = encryptor.seal(b"same body", alice).await.unwrap();
    let for_bob = encryptor.seal(b"same body", bob).await.unwrap();

    assert_ne!(for_alice, for_bob);
    assert!(encryptor.unseal(&for_alice, bob).await.is_err());
    assert_eq!(encryptor.unseal(&for_bob, bob).await.unwrap(), b"same body");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_remove_leaves_consistent_count() {
    let registry = ConnectionRegistry::new();
    let alice = Uuid::new_v4();

    let mut handles = Vec::new();
    for i in 0..64 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let (conn, frames) = Connection::new(
                registry.next_session_id(),
                alice,
                format!("device-{i}"),
                DeviceCategory::Mobile,
            );
            let session_id = conn.session_id;
            registry.add(Arc::new(conn)).await;
            // Every other session disconnects again.
            if i % 2 == 0 {
                registry
                    .remove_session(DeviceCategory::Mobile, alice, session_id)
                    .await;
                // Removing twice is harmless.
                assert!(
                    !registry
                        .remove_session(DeviceCategory::Mobile, alice, session_id)
                        .await
                );
            }
            (session_id, frames)
        }));
    }

    let mut seen = HashSet::new();
    let mut receivers = Vec::new();
    for handle in handles {
        let (session_id, frames) = handle.await.unwrap();
        assert!(seen.insert(session_id));
        receivers.push(frames);
    }

    assert_eq!(
        registry
            .count_live_sessions(DeviceCategory::Mobile, alice)
            .await,
        32
    );
    assert_eq!(registry.broadcast_all(alice, Frame::from_static(b"ping")).await, 32);
}
