//! Durable per-user FIFO of messages for users who were offline.
//!
//! Each user has one Redis stream (`{prefix}:{user_id}`). Entries hold frames
//! already sealed for that user, base64 encoded, so no plaintext reaches the
//! broker. Entries are consumed one at a time: the oldest entry is read,
//! replayed, and only then removed, so a failed replay leaves it at the head of
//! the queue.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics;
use crate::redis_client::RedisClient;
use crate::websocket::Frame;

const BODY_FIELD: &str = "body";

/// Deletes the stream only if it holds no entries, atomically with the check.
const DELETE_IF_EMPTY: &str = r#"
if redis.call('XLEN', KEYS[1]) == 0 then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEntry {
    pub id: String,
    pub body: String,
}

/// Storage contract of the offline queue.
#[async_trait]
pub trait OfflineBroker: Send + Sync {
    async fn publish(&self, queue: &str, body: String) -> Result<String, AppError>;

    /// Oldest entry, left in place.
    async fn peek(&self, queue: &str) -> Result<Option<BrokerEntry>, AppError>;

    async fn remove(&self, queue: &str, entry_id: &str) -> Result<(), AppError>;

    /// Delete the queue if it is empty. Returns false if entries arrived
    /// in the meantime.
    async fn delete_if_empty(&self, queue: &str) -> Result<bool, AppError>;

    async fn len(&self, queue: &str) -> Result<usize, AppError>;

    async fn exists(&self, queue: &str) -> Result<bool, AppError>;
}

pub struct RedisStreamBroker {
    redis: RedisClient,
    delete_if_empty: redis::Script,
}

impl RedisStreamBroker {
    pub fn new(redis: RedisClient) -> Self {
        Self {
            redis,
            delete_if_empty: redis::Script::new(DELETE_IF_EMPTY),
        }
    }
}

#[async_trait]
impl OfflineBroker for RedisStreamBroker {
    async fn publish(&self, queue: &str, body: String) -> Result<String, AppError> {
        let mut conn = self.redis.connection();
        let entry_id: String = conn
            .xadd::<_, _, _, _, String>(queue, "*", &[(BODY_FIELD, body)])
            .await?;
        Ok(entry_id)
    }

    async fn peek(&self, queue: &str) -> Result<Option<BrokerEntry>, AppError> {
        let mut conn = self.redis.connection();
        let entries: Vec<(String, HashMap<String, String>)> = redis::cmd("XRANGE")
            .arg(queue)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(entries.into_iter().next().map(|(id, mut fields)| BrokerEntry {
            body: fields.remove(BODY_FIELD).unwrap_or_default(),
            id,
        }))
    }

    async fn remove(&self, queue: &str, entry_id: &str) -> Result<(), AppError> {
        let mut conn = self.redis.connection();
        conn.xdel::<_, _, ()>(queue, &[entry_id]).await?;
        Ok(())
    }

    async fn delete_if_empty(&self, queue: &str) -> Result<bool, AppError> {
        let mut conn = self.redis.connection();
        let deleted = self
            .delete_if_empty
            .key(queue)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn len(&self, queue: &str) -> Result<usize, AppError> {
        let mut conn = self.redis.connection();
        let len: usize = conn.xlen(queue).await?;
        Ok(len)
    }

    async fn exists(&self, queue: &str) -> Result<bool, AppError> {
        let mut conn = self.redis.connection();
        let exists: bool = conn.exists(queue).await?;
        Ok(exists)
    }
}

/// Process-local broker for tests and single-node development.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<BrokerEntry>>>,
    next_id: Mutex<u64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, VecDeque<BrokerEntry>>>, AppError> {
        self.queues
            .lock()
            .map_err(|_| AppError::Broker("memory broker lock poisoned".into()))
    }
}

#[async_trait]
impl OfflineBroker for MemoryBroker {
    async fn publish(&self, queue: &str, body: String) -> Result<String, AppError> {
        let id = {
            let mut next = self
                .next_id
                .lock()
                .map_err(|_| AppError::Broker("memory broker lock poisoned".into()))?;
            *next += 1;
            format!("{}-0", *next)
        };
        self.lock()?
            .entry(queue.to_string())
            .or_default()
            .push_back(BrokerEntry {
                id: id.clone(),
                body,
            });
        Ok(id)
    }

    async fn peek(&self, queue: &str) -> Result<Option<BrokerEntry>, AppError> {
        Ok(self.lock()?.get(queue).and_then(|q| q.front().cloned()))
    }

    async fn remove(&self, queue: &str, entry_id: &str) -> Result<(), AppError> {
        if let Some(q) = self.lock()?.get_mut(queue) {
            q.retain(|entry| entry.id != entry_id);
        }
        Ok(())
    }

    async fn delete_if_empty(&self, queue: &str) -> Result<bool, AppError> {
        let mut queues = self.lock()?;
        match queues.get(queue) {
            Some(q) if !q.is_empty() => Ok(false),
            _ => {
                queues.remove(queue);
                Ok(true)
            }
        }
    }

    async fn len(&self, queue: &str) -> Result<usize, AppError> {
        Ok(self.lock()?.get(queue).map(VecDeque::len).unwrap_or(0))
    }

    async fn exists(&self, queue: &str) -> Result<bool, AppError> {
        Ok(self.lock()?.contains_key(queue))
    }
}

/// Destination of replayed entries.
#[async_trait]
pub trait ReplaySink: Send + Sync {
    /// Deliver one sealed frame. An error stops the drain and keeps the entry.
    async fn replay(&self, frame: Frame) -> Result<(), AppError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub replayed: usize,
    pub discarded: usize,
    /// Another drain for the same user was running and this one waited for it.
    pub waited: bool,
}

type DrainSlots = Arc<Mutex<HashMap<Uuid, Arc<Notify>>>>;

enum Claim {
    Acquired(DrainGuard),
    Busy(Arc<Notify>),
}

#[derive(Clone)]
pub struct OfflineQueue {
    broker: Arc<dyn OfflineBroker>,
    prefix: String,
    draining: DrainSlots,
}

impl OfflineQueue {
    pub fn new(broker: Arc<dyn OfflineBroker>, prefix: impl Into<String>) -> Self {
        Self {
            broker,
            prefix: prefix.into(),
            draining: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn queue_name(&self, user_id: Uuid) -> String {
        format!("{}:{}", self.prefix, user_id)
    }

    /// Append a frame sealed for `user_id` to that user's queue.
    pub async fn enqueue(&self, user_id: Uuid, frame: &Frame) -> Result<(), AppError> {
        let queue = self.queue_name(user_id);
        let entry_id = self.broker.publish(&queue, BASE64.encode(frame)).await?;
        tracing::debug!(
            user_id = %user_id,
            entry_id = %entry_id,
            bytes = frame.len(),
            "queued message for offline user"
        );
        Ok(())
    }

    pub async fn pending(&self, user_id: Uuid) -> Result<usize, AppError> {
        self.broker.len(&self.queue_name(user_id)).await
    }

    pub async fn exists(&self, user_id: Uuid) -> Result<bool, AppError> {
        self.broker.exists(&self.queue_name(user_id)).await
    }

    /// Replay the user's queue into `sink`, oldest first, then delete it.
    ///
    /// Drains of one user run one after another. A drain requested while
    /// another is running waits for it to finish, whether it succeeded or not,
    /// and then replays whatever is left into its own sink.
    pub async fn drain(
        &self,
        user_id: Uuid,
        sink: &dyn ReplaySink,
    ) -> Result<DrainOutcome, AppError> {
        let mut outcome = DrainOutcome::default();
        let _guard = loop {
            match self.claim(user_id)? {
                Claim::Acquired(guard) => break guard,
                Claim::Busy(done) => {
                    outcome.waited = true;
                    tracing::debug!(user_id = %user_id, "drain already running, waiting");
                    let finished = done.notified();
                    // The running drain may have released its slot before
                    // `finished` was registered.
                    if self.still_running(user_id, &done)? {
                        finished.await;
                    }
                }
            }
        };

        self.drain_entries(user_id, sink, &mut outcome).await?;

        if outcome.replayed > 0 || outcome.discarded > 0 {
            tracing::info!(
                user_id = %user_id,
                replayed = outcome.replayed,
                discarded = outcome.discarded,
                "offline queue drained"
            );
        }
        Ok(outcome)
    }

    async fn drain_entries(
        &self,
        user_id: Uuid,
        sink: &dyn ReplaySink,
        outcome: &mut DrainOutcome,
    ) -> Result<(), AppError> {
        let queue = self.queue_name(user_id);
        loop {
            let Some(entry) = self.broker.peek(&queue).await? else {
                if self.broker.delete_if_empty(&queue).await? {
                    return Ok(());
                }
                // Entries were published after the peek; keep going.
                continue;
            };

            match BASE64.decode(entry.body.as_bytes()) {
                Ok(frame) => {
                    sink.replay(Frame::from(frame)).await?;
                    self.broker.remove(&queue, &entry.id).await?;
                    outcome.replayed += 1;
                    metrics::OFFLINE_REPLAYED.inc();
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        entry_id = %entry.id,
                        error = %e,
                        "discarding undecodable offline entry"
                    );
                    self.broker.remove(&queue, &entry.id).await?;
                    outcome.discarded += 1;
                    metrics::OFFLINE_DISCARDED.inc();
                }
            }
        }
    }

    fn claim(&self, user_id: Uuid) -> Result<Claim, AppError> {
        let mut draining = self.lock_draining()?;
        if let Some(done) = draining.get(&user_id) {
            return Ok(Claim::Busy(done.clone()));
        }
        let done = Arc::new(Notify::new());
        draining.insert(user_id, done.clone());
        Ok(Claim::Acquired(DrainGuard {
            draining: self.draining.clone(),
            user_id,
            done,
        }))
    }

    fn still_running(&self, user_id: Uuid, done: &Arc<Notify>) -> Result<bool, AppError> {
        Ok(self
            .lock_draining()?
            .get(&user_id)
            .is_some_and(|current| Arc::ptr_eq(current, done)))
    }

    fn lock_draining(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Notify>>>, AppError> {
        self.draining.lock().map_err(|_| AppError::Internal)
    }
}

/// Releases the user's drain slot and wakes waiting drains, also when the
/// drain fails or is cancelled.
struct DrainGuard {
    draining: DrainSlots,
    user_id: Uuid,
    done: Arc<Notify>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if let Ok(mut draining) = self.draining.lock() {
            draining.remove(&self.user_id);
        }
        self.done.notify_waiters();
    }
}
