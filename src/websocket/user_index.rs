use super::connection::{Connection, Frame};
use crate::models::SessionId;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddRejected {
    /// The bucket has already dropped this index; resolve it again.
    Retired,
    /// The user already holds the maximum number of sessions.
    Full,
}

#[derive(Default)]
struct IndexState {
    connections: Vec<Arc<Connection>>,
    retired: bool,
}

/// All live sessions of one user within one partition.
pub(crate) struct UserIndex {
    user_id: Uuid,
    state: Mutex<IndexState>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BroadcastOutcome {
    pub delivered: usize,
    pub evicted: usize,
    pub remaining: usize,
}

impl UserIndex {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            state: Mutex::new(IndexState::default()),
        }
    }

    /// Add a session unless `limit` sessions are already present. Re-adding a
    /// session id that is already present is a no-op.
    pub async fn add(
        &self,
        conn: Arc<Connection>,
        limit: Option<usize>,
    ) -> Result<usize, AddRejected> {
        let mut state = self.state.lock().await;
        if state.retired {
            return Err(AddRejected::Retired);
        }
        if state
            .connections
            .iter()
            .any(|c| c.session_id == conn.session_id)
        {
            return Ok(state.connections.len());
        }
        if limit.is_some_and(|max| state.connections.len() >= max) {
            return Err(AddRejected::Full);
        }
        state.connections.push(conn);
        Ok(state.connections.len())
    }

    /// Remove one session. Returns the removed connection (if present) and the
    /// number of sessions left.
    pub async fn remove(&self, session_id: SessionId) -> (Option<Arc<Connection>>, usize) {
        let mut state = self.state.lock().await;
        let position = state
            .connections
            .iter()
            .position(|c| c.session_id == session_id);
        let removed = position.map(|pos| state.connections.swap_remove(pos));
        (removed, state.connections.len())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Hand a frame to every session, evicting those whose transport is gone.
    pub async fn broadcast(&self, frame: &Frame) -> BroadcastOutcome {
        let mut state = self.state.lock().await;
        let before = state.connections.len();
        state.connections.retain(|conn| match conn.send(frame.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(
                    user_id = %conn.user_id,
                    session_id = %conn.session_id,
                    "evicting closed connection during broadcast"
                );
                false
            }
        });
        let remaining = state.connections.len();
        BroadcastOutcome {
            delivered: remaining,
            evicted: before - remaining,
            remaining,
        }
    }

    /// Mark the index retired if it holds no sessions. A retired index never
    /// accepts connections again.
    pub async fn retire_if_empty(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.connections.is_empty() {
            state.retired = true;
        }
        state.retired
    }

    /// Retire unconditionally and hand back every session.
    pub async fn retire(&self) -> Vec<Arc<Connection>> {
        let mut state = self.state.lock().await;
        state.retired = true;
        std::mem::take(&mut state.connections)
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}
