use crate::models::{DeviceCategory, SessionId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

mod bucket;
pub mod connection;
pub mod session;
mod user_index;

use crate::error::AppError;
use bucket::Bucket;
use user_index::AddRejected;

pub use connection::{Connection, Frame, SessionKey};

/// Connection registry for live WebSocket sessions.
///
/// Single source of truth for "is this user reachable right now, and on which
/// sessions". Partitioned into one [`Bucket`] per [`DeviceCategory`], created
/// up front. Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    buckets: [Bucket; DeviceCategory::COUNT],
    next_session: AtomicU64,
    // Sessions that must announce their user offline when their transport
    // finally closes (see `remove_user`).
    evictions: Mutex<HashSet<SessionId>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                buckets: DeviceCategory::ALL.map(Bucket::new),
                next_session: AtomicU64::new(1),
                evictions: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn bucket(&self, category: DeviceCategory) -> &Bucket {
        &self.inner.buckets[category.index()]
    }

    /// Allocate the id for a session being accepted.
    pub fn next_session_id(&self) -> SessionId {
        SessionId::new(self.inner.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a connection in its category's partition.
    ///
    /// Returns the user's session count in that partition afterwards.
    pub async fn add(&self, conn: Arc<Connection>) -> usize {
        // Only bounded inserts are ever refused.
        self.insert(conn, None).await.unwrap_or_default()
    }

    /// Like [`add`](Self::add), but refuses the connection if the user already
    /// holds `max_sessions` sessions in the partition. The check and the insert
    /// happen under the same per-user lock.
    pub async fn try_add(
        &self,
        conn: Arc<Connection>,
        max_sessions: usize,
    ) -> Result<usize, AppError> {
        self.insert(conn, Some(max_sessions))
            .await
            .map_err(|_| AppError::DeviceLimitExceeded { max: max_sessions })
    }

    async fn insert(
        &self,
        conn: Arc<Connection>,
        limit: Option<usize>,
    ) -> Result<usize, AddRejected> {
        let bucket = self.bucket(conn.category);
        loop {
            let index = bucket.get_or_insert(conn.user_id).await;
            match index.add(conn.clone(), limit).await {
                Ok(count) => {
                    tracing::debug!(
                        user_id = %conn.user_id,
                        session_id = %conn.session_id,
                        category = %conn.category,
                        sessions = count,
                        "registered connection"
                    );
                    return Ok(count);
                }
                // Lost a race with removal of the emptied index; look it up again.
                Err(AddRejected::Retired) => continue,
                Err(AddRejected::Full) => {
                    // A freshly created index may now be empty; don't leave it behind.
                    if index.len().await == 0 {
                        bucket.remove_if_empty(&index).await;
                    }
                    return Err(AddRejected::Full);
                }
            }
        }
    }

    /// Remove one session. Missing users or sessions are a no-op.
    pub async fn remove_session(
        &self,
        category: DeviceCategory,
        user_id: Uuid,
        session_id: SessionId,
    ) -> bool {
        let bucket = self.bucket(category);
        let Some(index) = bucket.get(user_id).await else {
            return false;
        };

        let (removed, remaining) = index.remove(session_id).await;
        if remaining == 0 {
            bucket.remove_if_empty(&index).await;
        }

        if removed.is_some() {
            tracing::debug!(
                user_id = %user_id,
                session_id = %session_id,
                category = %category,
                remaining,
                "removed connection"
            );
        }
        removed.is_some()
    }

    /// Sessions the user holds in one partition.
    pub async fn count_live_sessions(&self, category: DeviceCategory, user_id: Uuid) -> usize {
        match self.bucket(category).get(user_id).await {
            Some(index) => index.len().await,
            None => 0,
        }
    }

    /// Sessions the user holds across every partition.
    pub async fn total_live_sessions(&self, user_id: Uuid) -> usize {
        let mut total = 0;
        for category in DeviceCategory::ALL {
            total += self.count_live_sessions(category, user_id).await;
        }
        total
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.total_live_sessions(user_id).await > 0
    }

    /// Partitions in which the user currently has at least one session.
    pub async fn live_categories(&self, user_id: Uuid) -> Vec<DeviceCategory> {
        let mut categories = Vec::new();
        for category in DeviceCategory::ALL {
            if self.count_live_sessions(category, user_id).await > 0 {
                categories.push(category);
            }
        }
        categories
    }

    /// Hand a sealed frame to every session of the user in one partition.
    ///
    /// Sessions whose transport is gone are evicted; if none remain, the user's
    /// index is dropped. Returns the number of sessions the frame reached.
    pub async fn broadcast(&self, category: DeviceCategory, user_id: Uuid, frame: Frame) -> usize {
        let bucket = self.bucket(category);
        let Some(index) = bucket.get(user_id).await else {
            return 0;
        };

        let outcome = index.broadcast(&frame).await;
        if outcome.evicted > 0 {
            tracing::debug!(
                user_id = %user_id,
                category = %category,
                evicted = outcome.evicted,
                active = outcome.remaining,
                "broadcast cleaned up closed connections"
            );
        }
        if outcome.remaining == 0 {
            bucket.remove_if_empty(&index).await;
        }
        outcome.delivered
    }

    /// [`broadcast`](Self::broadcast) over every partition.
    pub async fn broadcast_all(&self, user_id: Uuid, frame: Frame) -> usize {
        let mut delivered = 0;
        for category in DeviceCategory::ALL {
            delivered += self.broadcast(category, user_id, frame.clone()).await;
        }
        delivered
    }

    /// Remove the user from every partition.
    ///
    /// Evicted sessions lose their registry handle, so their transports close
    /// once in-flight work drops its clones. The first evicted session is
    /// remembered so that its disconnect still announces the user offline.
    pub async fn remove_user(&self, user_id: Uuid) -> Vec<Arc<Connection>> {
        let mut evicted = Vec::new();
        for category in DeviceCategory::ALL {
            if let Some(index) = self.bucket(category).remove(user_id).await {
                evicted.extend(index.retire().await);
            }
        }

        if let Some(first) = evicted.first() {
            if let Ok(mut evictions) = self.inner.evictions.lock() {
                evictions.insert(first.session_id);
            }
            tracing::info!(
                user_id = %user_id,
                sessions = evicted.len(),
                "evicted user from registry"
            );
        }
        evicted
    }

    /// Consume the eviction marker left by [`remove_user`](Self::remove_user).
    pub fn take_eviction(&self, session_id: SessionId) -> bool {
        self.inner
            .evictions
            .lock()
            .map(|mut evictions| evictions.remove(&session_id))
            .unwrap_or(false)
    }

    /// Drop every partition's content. Used at shutdown.
    pub async fn reset(&self) {
        let mut sessions = 0;
        for bucket in &self.inner.buckets {
            for index in bucket.take_all().await {
                sessions += index.retire().await.len();
            }
        }
        if let Ok(mut evictions) = self.inner.evictions.lock() {
            evictions.clear();
        }
        tracing::info!(sessions, "connection registry reset");
    }

    /// Distinct users with at least one session in the partition.
    pub async fn user_count(&self, category: DeviceCategory) -> usize {
        self.bucket(category).user_count().await
    }

    pub async fn connection_count(&self) -> usize {
        let mut total = 0;
        for bucket in &self.inner.buckets {
            for index in bucket.indexes().await {
                total += index.len().await;
            }
        }
        total
    }
}
