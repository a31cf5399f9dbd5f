use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::config::DeviceLimitConfig;
use crate::error::AppError;
use crate::metrics;
use crate::models::{DeviceCategory, FriendStatus, Payload, PresenceStatus, WsEvent, WsMsg};
use crate::services::dispatcher::PushDispatcher;
use crate::services::encryption::EncryptionGate;
use crate::services::fanout::TaskGroup;
use crate::services::offline_queue::{OfflineQueue, ReplaySink};
use crate::services::relation_client::RelationService;
use crate::websocket::{Connection, ConnectionRegistry, Frame, SessionKey};

/// A session accepted by [`PresenceEngine::on_connect`]. The transport owns
/// `frames` and writes everything that arrives on it to the socket.
pub struct SessionHandle {
    pub key: SessionKey,
    pub frames: UnboundedReceiver<Frame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceSnapshot {
    pub user_id: Uuid,
    pub online: bool,
    pub sessions: BTreeMap<DeviceCategory, usize>,
}

/// Connect/disconnect lifecycle and the presence announcements around it.
#[derive(Clone)]
pub struct PresenceEngine {
    registry: ConnectionRegistry,
    dispatcher: PushDispatcher,
    gate: EncryptionGate,
    queue: OfflineQueue,
    relations: Arc<dyn RelationService>,
    device_limit: DeviceLimitConfig,
    tasks: TaskGroup,
}

impl PresenceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ConnectionRegistry,
        dispatcher: PushDispatcher,
        gate: EncryptionGate,
        queue: OfflineQueue,
        relations: Arc<dyn RelationService>,
        device_limit: DeviceLimitConfig,
        tasks: TaskGroup,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            gate,
            queue,
            relations,
            device_limit,
            tasks,
        }
    }

    /// Register a newly authenticated session.
    ///
    /// Fails with [`AppError::DeviceLimitExceeded`] if the user already holds
    /// the maximum number of sessions in `category`; nothing is registered in
    /// that case. The online announcement and offline replay run in the
    /// background.
    pub async fn on_connect(
        &self,
        user_id: Uuid,
        driver_id: impl Into<String>,
        category: DeviceCategory,
    ) -> Result<SessionHandle, AppError> {
        let (conn, frames) =
            Connection::new(self.registry.next_session_id(), user_id, driver_id, category);
        let conn = Arc::new(conn);
        let key = SessionKey::from(conn.as_ref());

        match self.device_limit.limit() {
            Some(max) => {
                if let Err(e) = self.registry.try_add(conn.clone(), max).await {
                    metrics::record_rejection("device_limit");
                    tracing::info!(
                        user_id = %user_id,
                        category = %category,
                        max,
                        "rejecting connection: login devices exceed limit"
                    );
                    return Err(e);
                }
            }
            None => {
                self.registry.add(conn.clone()).await;
            }
        }
        metrics::WS_CONNECTIONS.inc();

        let engine = self.clone();
        self.tasks
            .spawn("announce_online", async move { engine.announce_online(conn).await });

        Ok(SessionHandle { key, frames })
    }

    /// Unregister a session whose transport closed.
    ///
    /// Returns true if this was the user's last session anywhere, in which case
    /// friends are told the user went offline.
    pub async fn on_disconnect(&self, key: SessionKey) -> bool {
        metrics::WS_CONNECTIONS.dec();

        let removed = self
            .registry
            .remove_session(key.category, key.user_id, key.session_id)
            .await;
        // Sessions evicted by an Offline push are already gone from the
        // registry; one of them still carries the announcement.
        let evicted = self.registry.take_eviction(key.session_id);
        if !removed && !evicted {
            return false;
        }

        if self.registry.total_live_sessions(key.user_id).await > 0 {
            return false;
        }

        tracing::info!(user_id = %key.user_id, "user went offline");
        let engine = self.clone();
        let user_id = key.user_id;
        self.tasks.spawn("announce_offline", async move {
            engine
                .announce_status(user_id, PresenceStatus::Offline)
                .await;
            Ok(())
        });
        true
    }

    pub async fn snapshot(&self, user_id: Uuid) -> PresenceSnapshot {
        let mut sessions = BTreeMap::new();
        for category in DeviceCategory::ALL {
            sessions.insert(
                category,
                self.registry.count_live_sessions(category, user_id).await,
            );
        }
        PresenceSnapshot {
            user_id,
            online: sessions.values().any(|n| *n > 0),
            sessions,
        }
    }

    async fn announce_online(&self, conn: Arc<Connection>) -> Result<(), AppError> {
        let user_id = conn.user_id;

        let ack = WsMsg::new(user_id, WsEvent::Online, Payload::null())
            .with_session(conn.session_id)
            .with_driver(conn.driver_id.clone());
        if let Err(e) = self.send_to(&conn, &ack).await {
            tracing::warn!(
                user_id = %user_id,
                session_id = %conn.session_id,
                error = %e,
                "failed to send online acknowledgement"
            );
        }

        let friends = self.friends_of(user_id).await;

        let mut statuses = Vec::with_capacity(friends.len());
        for friend_id in &friends {
            let status = if self.registry.is_online(*friend_id).await {
                PresenceStatus::Online
            } else {
                PresenceStatus::Offline
            };
            statuses.push(FriendStatus {
                user_id: *friend_id,
                status,
            });
        }
        let snapshot = WsMsg::new(
            user_id,
            WsEvent::BulkFriendOnlineStatus,
            Payload::from_json(&statuses)?,
        )
        .with_session(conn.session_id);
        if let Err(e) = self.send_to(&conn, &snapshot).await {
            tracing::warn!(user_id = %user_id, error = %e, "failed to send friend status snapshot");
        }

        // A client that left already has been (or will be) announced offline.
        if conn.is_closed() {
            return Ok(());
        }
        self.fan_out_status(user_id, PresenceStatus::Online, &friends)?;

        let sink = SessionSink { conn: conn.clone() };
        match self.queue.drain(user_id, &sink).await {
            Ok(outcome) => {
                tracing::debug!(
                    user_id = %user_id,
                    replayed = outcome.replayed,
                    waited = outcome.waited,
                    "offline replay finished"
                );
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "offline replay aborted");
            }
        }
        Ok(())
    }

    async fn announce_status(&self, user_id: Uuid, status: PresenceStatus) {
        let friends = self.friends_of(user_id).await;
        if let Err(e) = self.fan_out_status(user_id, status, &friends) {
            tracing::warn!(user_id = %user_id, error = %e, "failed to announce presence change");
        }
    }

    /// One independent push per friend; a slow or failing friend does not
    /// hold up the others.
    fn fan_out_status(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        friends: &[Uuid],
    ) -> Result<(), AppError> {
        let payload = Payload::from_json(&FriendStatus { user_id, status })?;
        for friend_id in friends {
            let msg = WsMsg::new(*friend_id, WsEvent::FriendOnlineStatusChanged, payload.clone());
            let dispatcher = self.dispatcher.clone();
            self.tasks.spawn("friend_status", async move {
                dispatcher.push_one(msg).await.map(|_| ())
            });
        }
        Ok(())
    }

    async fn friends_of(&self, user_id: Uuid) -> Vec<Uuid> {
        match self.relations.get_friend_list(user_id).await {
            Ok(friends) => friends,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "failed to fetch friend list");
                Vec::new()
            }
        }
    }

    async fn send_to(&self, conn: &Connection, msg: &WsMsg) -> Result<(), AppError> {
        let frame = self.gate.seal_msg(msg).await?;
        conn.send(frame)
    }
}

/// Replays queued messages to the one session that just connected.
struct SessionSink {
    conn: Arc<Connection>,
}

#[async_trait]
impl ReplaySink for SessionSink {
    async fn replay(&self, frame: Frame) -> Result<(), AppError> {
        self.conn.send(frame)
    }
}
