//! Push event delivered to client sessions.
//!
//! Wire shape (before sealing):
//! ```json
//! {
//!     "uid": "uuid",
//!     "event": 3,
//!     "rid": 42,
//!     "driver_id": "web-7f3a",
//!     "send_at": 1735689600000,
//!     "push_offline": true,
//!     "data": { ... }
//! }
//! ```
//! `data` is opaque to this service; clients interpret it according to `event`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Event discriminant carried as an integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum WsEvent {
    Online = 1,
    Offline = 2,
    SendUserMessage = 3,
    SendGroupMessage = 4,
    SystemNotification = 5,
    FriendOnlineStatusChanged = 6,
    BulkFriendOnlineStatus = 7,
}

impl From<WsEvent> for u8 {
    fn from(event: WsEvent) -> Self {
        event as u8
    }
}

impl TryFrom<u8> for WsEvent {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WsEvent::Online),
            2 => Ok(WsEvent::Offline),
            3 => Ok(WsEvent::SendUserMessage),
            4 => Ok(WsEvent::SendGroupMessage),
            5 => Ok(WsEvent::SystemNotification),
            6 => Ok(WsEvent::FriendOnlineStatusChanged),
            7 => Ok(WsEvent::BulkFriendOnlineStatus),
            other => Err(format!("unknown event code {other}")),
        }
    }
}

/// Process-local identifier of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque event body.
///
/// Always holds one complete JSON document; it is embedded verbatim as `data`
/// in the wire object rather than as an escaped string.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    /// `null` body, used by events that carry no data.
    pub fn null() -> Self {
        Self(Bytes::from_static(b"null"))
    }

    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(|v| Self(Bytes::from(v)))
    }

    /// Wrap raw bytes after checking they form a JSON document.
    pub fn from_raw(raw: impl Into<Bytes>) -> Result<Self, serde_json::Error> {
        let raw = raw.into();
        serde_json::from_slice::<serde::de::IgnoredAny>(&raw)?;
        Ok(Self(raw))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    pub fn is_null(&self) -> bool {
        self.0.as_ref() == b"null"
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        // Serializing a Value into memory cannot fail.
        Self(Bytes::from(value.to_string()))
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value: serde_json::Value = serde_json::from_slice(&self.0).map_err(S::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        serde_json::to_vec(&value)
            .map(|v| Payload(Bytes::from(v)))
            .map_err(D::Error::custom)
    }
}

/// One push event addressed to a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMsg {
    #[serde(rename = "uid")]
    pub target_user_id: Uuid,
    pub event: WsEvent,
    #[serde(rename = "rid", default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub driver_id: String,
    #[serde(rename = "send_at", with = "chrono::serde::ts_milliseconds")]
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub push_offline: bool,
    #[serde(rename = "data", default)]
    pub payload: Payload,
}

impl WsMsg {
    pub fn new(target_user_id: Uuid, event: WsEvent, payload: Payload) -> Self {
        Self {
            target_user_id,
            event,
            session_id: None,
            driver_id: String::new(),
            sent_at: Utc::now(),
            push_offline: false,
            payload,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_driver(mut self, driver_id: impl Into<String>) -> Self {
        self.driver_id = driver_id.into();
        self
    }

    pub fn with_push_offline(mut self, push_offline: bool) -> Self {
        self.push_offline = push_offline;
        self
    }

    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = sent_at;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// `data` of `FriendOnlineStatusChanged`; `BulkFriendOnlineStatus` carries an
/// array of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendStatus {
    pub user_id: Uuid,
    pub status: PresenceStatus,
}
