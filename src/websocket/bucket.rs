use super::user_index::UserIndex;
use crate::models::DeviceCategory;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Registry partition for one device category.
///
/// The lock guards only the user map. Per-connection work happens under the
/// owning [`UserIndex`] lock, so sessions of different users never contend.
/// Lock order is always bucket first, then index.
pub(crate) struct Bucket {
    category: DeviceCategory,
    users: RwLock<HashMap<Uuid, Arc<UserIndex>>>,
}

impl Bucket {
    pub fn new(category: DeviceCategory) -> Self {
        Self {
            category,
            users: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, user_id: Uuid) -> Option<Arc<UserIndex>> {
        self.users.read().await.get(&user_id).cloned()
    }

    pub async fn get_or_insert(&self, user_id: Uuid) -> Arc<UserIndex> {
        if let Some(index) = self.get(user_id).await {
            return index;
        }
        let mut users = self.users.write().await;
        users
            .entry(user_id)
            .or_insert_with(|| Arc::new(UserIndex::new(user_id)))
            .clone()
    }

    /// Drop the user's index if it is (still) the given one and holds no
    /// sessions.
    pub async fn remove_if_empty(&self, index: &Arc<UserIndex>) -> bool {
        let user_id = index.user_id();
        let mut users = self.users.write().await;
        let is_current = users
            .get(&user_id)
            .map(|current| Arc::ptr_eq(current, index))
            .unwrap_or(false);
        if !is_current || !index.retire_if_empty().await {
            return false;
        }
        users.remove(&user_id);
        tracing::debug!(
            user_id = %user_id,
            category = %self.category,
            "removed empty user index"
        );
        true
    }

    /// Detach the user's index entirely.
    pub async fn remove(&self, user_id: Uuid) -> Option<Arc<UserIndex>> {
        self.users.write().await.remove(&user_id)
    }

    /// Detach every index, e.g. at shutdown.
    pub async fn take_all(&self) -> Vec<Arc<UserIndex>> {
        let mut users = self.users.write().await;
        users.drain().map(|(_, index)| index).collect()
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn indexes(&self) -> Vec<Arc<UserIndex>> {
        self.users.read().await.values().cloned().collect()
    }
}
