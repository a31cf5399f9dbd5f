use actix_web::{post, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Payload, SessionId, WsEvent, WsMsg};
use crate::services::PushOutcome;
use crate::state::AppState;

/// Largest number of messages or recipients accepted in one request.
pub const MAX_BATCH_SIZE: usize = 1000;

/// One push, in the same field layout as the outbound wire event.
#[derive(Debug, Deserialize)]
pub struct PushMessageRequest {
    pub uid: Uuid,
    pub event: WsEvent,
    #[serde(default)]
    pub rid: Option<SessionId>,
    #[serde(default)]
    pub driver_id: String,
    /// Epoch milliseconds; defaults to the time of receipt.
    #[serde(default)]
    pub send_at: Option<i64>,
    #[serde(default)]
    pub push_offline: bool,
    #[serde(default)]
    pub data: Payload,
}

impl PushMessageRequest {
    fn into_msg(self) -> Result<WsMsg, AppError> {
        let mut msg = WsMsg::new(self.uid, self.event, self.data)
            .with_driver(self.driver_id)
            .with_push_offline(self.push_offline);
        if let Some(rid) = self.rid {
            msg = msg.with_session(rid);
        }
        if let Some(ms) = self.send_at {
            let sent_at = DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| AppError::BadRequest(format!("send_at out of range: {ms}")))?;
            msg = msg.with_sent_at(sent_at);
        }
        Ok(msg)
    }
}

#[derive(Debug, Deserialize)]
pub struct PushBatchRequest {
    pub messages: Vec<PushMessageRequest>,
}

#[derive(Debug, Deserialize)]
pub struct PushUsersRequest {
    pub user_ids: Vec<Uuid>,
    pub event: WsEvent,
    #[serde(default)]
    pub data: Payload,
    #[serde(default)]
    pub push_offline: bool,
}

#[derive(Debug, Serialize)]
pub struct PushAck {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<usize>,
}

impl From<PushOutcome> for PushAck {
    fn from(outcome: PushOutcome) -> Self {
        match outcome {
            PushOutcome::Delivered { sessions } => PushAck {
                outcome: "delivered",
                sessions: Some(sessions),
            },
            PushOutcome::Queued => PushAck {
                outcome: "queued",
                sessions: None,
            },
            PushOutcome::Dropped => PushAck {
                outcome: "dropped",
                sessions: None,
            },
        }
    }
}

fn check_batch_size(len: usize) -> Result<(), AppError> {
    if len > MAX_BATCH_SIZE {
        return Err(AppError::BadRequest(format!(
            "batch of {len} exceeds the limit of {MAX_BATCH_SIZE}"
        )));
    }
    Ok(())
}

#[post("/internal/v1/push/one")]
pub async fn push_one(
    state: web::Data<AppState>,
    body: web::Json<PushMessageRequest>,
) -> AppResult<HttpResponse> {
    let msg = body.into_inner().into_msg()?;
    let outcome = state.dispatcher.push_one(msg).await?;
    Ok(HttpResponse::Ok().json(PushAck::from(outcome)))
}

#[post("/internal/v1/push/batch")]
pub async fn push_batch(
    state: web::Data<AppState>,
    body: web::Json<PushBatchRequest>,
) -> AppResult<HttpResponse> {
    let request = body.into_inner();
    check_batch_size(request.messages.len())?;

    let msgs = request
        .messages
        .into_iter()
        .map(PushMessageRequest::into_msg)
        .collect::<Result<Vec<_>, _>>()?;

    let report = state.dispatcher.push_batch(msgs).await;
    Ok(HttpResponse::Ok().json(report))
}

#[post("/internal/v1/push/users")]
pub async fn push_users(
    state: web::Data<AppState>,
    body: web::Json<PushUsersRequest>,
) -> AppResult<HttpResponse> {
    let request = body.into_inner();
    check_batch_size(request.user_ids.len())?;

    let report = state
        .dispatcher
        .push_to_users(
            &request.user_ids,
            request.event,
            request.data,
            request.push_offline,
        )
        .await;
    Ok(HttpResponse::Ok().json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_maps_wire_fields() {
        let uid = Uuid::new_v4();
        let request: PushMessageRequest = serde_json::from_value(serde_json::json!({
            "uid": uid,
            "event": 3,
            "rid": 42,
            "driver_id": "ipad-1",
            "send_at": 1_700_000_000_000i64,
            "push_offline": true,
            "data": { "text": "hi" }
        }))
        .unwrap();

        let msg = request.into_msg().unwrap();
        assert_eq!(msg.target_user_id, uid);
        assert_eq!(msg.event, WsEvent::SendUserMessage);
        assert_eq!(msg.session_id, Some(SessionId::new(42)));
        assert_eq!(msg.driver_id, "ipad-1");
        assert_eq!(msg.sent_at.timestamp_millis(), 1_700_000_000_000);
        assert!(msg.push_offline);
    }

    #[test]
    fn test_minimal_request_gets_defaults() {
        let request: PushMessageRequest = serde_json::from_value(serde_json::json!({
            "uid": Uuid::new_v4(),
            "event": 5
        }))
        .unwrap();

        let msg = request.into_msg().unwrap();
        assert!(!msg.push_offline);
        assert!(msg.payload.is_null());
        assert!(msg.session_id.is_none());
    }

    #[test]
    fn test_oversized_batch_is_rejected() {
        assert!(check_batch_size(MAX_BATCH_SIZE).is_ok());
        assert!(matches!(
            check_batch_size(MAX_BATCH_SIZE + 1),
            Err(AppError::BadRequest(_))
        ));
    }
}
