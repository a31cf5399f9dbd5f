use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics;
use crate::models::{Payload, WsEvent, WsMsg};
use crate::services::encryption::EncryptionGate;
use crate::services::fanout::TaskGroup;
use crate::services::offline_queue::{OfflineQueue, ReplaySink};
use crate::websocket::{ConnectionRegistry, Frame};

/// Recipients handled concurrently by [`PushDispatcher::push_to_users`].
const MULTI_PUSH_CONCURRENCY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered { sessions: usize },
    Queued,
    Dropped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub delivered: usize,
    pub queued: usize,
    pub dropped: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BatchReport {
    fn record(&mut self, result: Result<PushOutcome, AppError>) {
        match result {
            Ok(PushOutcome::Delivered { .. }) => self.delivered += 1,
            Ok(PushOutcome::Queued) => self.queued += 1,
            Ok(PushOutcome::Dropped) => self.dropped += 1,
            Err(e) => {
                self.failed += 1;
                self.last_error = Some(e.to_string());
            }
        }
    }
}

/// Routes one message to its recipient: live sessions if any, otherwise the
/// offline queue (when the message asks for it).
#[derive(Clone)]
pub struct PushDispatcher {
    registry: ConnectionRegistry,
    gate: EncryptionGate,
    queue: OfflineQueue,
    tasks: TaskGroup,
}

impl PushDispatcher {
    pub fn new(
        registry: ConnectionRegistry,
        gate: EncryptionGate,
        queue: OfflineQueue,
        tasks: TaskGroup,
    ) -> Self {
        Self {
            registry,
            gate,
            queue,
            tasks,
        }
    }

    pub async fn push_one(&self, msg: WsMsg) -> Result<PushOutcome, AppError> {
        let user_id = msg.target_user_id;

        if self.registry.is_online(user_id).await {
            let frame = self.gate.seal_msg(&msg).await?;
            let sessions = self.registry.broadcast_all(user_id, frame).await;
            if sessions > 0 {
                if msg.event == WsEvent::Offline {
                    self.registry.remove_user(user_id).await;
                }
                metrics::record_push("delivered");
                tracing::debug!(
                    user_id = %user_id,
                    event = ?msg.event,
                    sessions,
                    "delivered push to live sessions"
                );
                return Ok(PushOutcome::Delivered { sessions });
            }
            // Every session closed between the lookup and the broadcast.
        }

        self.push_offline(msg).await
    }

    async fn push_offline(&self, msg: WsMsg) -> Result<PushOutcome, AppError> {
        let user_id = msg.target_user_id;
        if !msg.push_offline {
            metrics::record_push("dropped");
            tracing::debug!(
                user_id = %user_id,
                event = ?msg.event,
                "recipient offline, dropping push"
            );
            return Ok(PushOutcome::Dropped);
        }

        // Sealed now, so the broker only ever holds ciphertext.
        let frame = self.gate.seal_msg(&msg).await?;
        self.queue.enqueue(user_id, &frame).await?;
        metrics::record_push("queued");

        // The recipient may have connected after the online check; their own
        // drain could already be past this entry.
        if self.registry.is_online(user_id).await {
            self.spawn_live_drain(user_id);
        }
        Ok(PushOutcome::Queued)
    }

    fn spawn_live_drain(&self, user_id: Uuid) {
        let sink = LiveSink {
            registry: self.registry.clone(),
            user_id,
        };
        let queue = self.queue.clone();
        self.tasks.spawn("late_offline_drain", async move {
            queue.drain(user_id, &sink).await.map(|_| ())
        });
    }

    /// Push each message in order. A failure is counted and does not stop or
    /// roll back the rest of the batch.
    pub async fn push_batch(&self, msgs: Vec<WsMsg>) -> BatchReport {
        let mut report = BatchReport::default();
        for msg in msgs {
            let user_id = msg.target_user_id;
            let result = self.push_one(msg).await;
            if let Err(e) = &result {
                metrics::record_push("failed");
                tracing::warn!(user_id = %user_id, error = %e, "batch push entry failed");
            }
            report.record(result);
        }
        report
    }

    /// Push the same event to many users, each sealed for its own recipient.
    pub async fn push_to_users(
        &self,
        user_ids: &[Uuid],
        event: WsEvent,
        payload: Payload,
        push_offline: bool,
    ) -> BatchReport {
        let mut seen = HashSet::with_capacity(user_ids.len());
        let msgs: Vec<WsMsg> = user_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .map(|id| WsMsg::new(id, event, payload.clone()).with_push_offline(push_offline))
            .collect();

        let results: Vec<(Uuid, Result<PushOutcome, AppError>)> = stream::iter(msgs)
            .map(|msg| async move {
                let user_id = msg.target_user_id;
                (user_id, self.push_one(msg).await)
            })
            .buffer_unordered(MULTI_PUSH_CONCURRENCY)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (user_id, result) in results {
            if let Err(e) = &result {
                metrics::record_push("failed");
                tracing::warn!(user_id = %user_id, error = %e, "multi-user push failed");
            }
            report.record(result);
        }
        report
    }
}

/// Replays queued messages to whatever sessions the user has right now.
struct LiveSink {
    registry: ConnectionRegistry,
    user_id: Uuid,
}

#[async_trait]
impl ReplaySink for LiveSink {
    async fn replay(&self, frame: Frame) -> Result<(), AppError> {
        match self.registry.broadcast_all(self.user_id, frame).await {
            0 => Err(AppError::ConnectionClosed),
            _ => Ok(()),
        }
    }
}
