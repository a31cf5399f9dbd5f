use crate::error::AppError;
use crate::models::{DeviceCategory, SessionId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// A sealed outbound frame, ready for the transport.
pub type Frame = Bytes;

/// One live transport session of one device.
///
/// The registry only hands frames to `sender`; the WebSocket actor owning the
/// receiving half performs the actual socket write. Once that actor is gone the
/// channel reports closed and the connection is evicted on the next broadcast.
#[derive(Debug)]
pub struct Connection {
    pub session_id: SessionId,
    pub user_id: Uuid,
    pub driver_id: String,
    pub category: DeviceCategory,
    pub connected_at: DateTime<Utc>,
    sender: UnboundedSender<Frame>,
}

impl Connection {
    pub fn new(
        session_id: SessionId,
        user_id: Uuid,
        driver_id: impl Into<String>,
        category: DeviceCategory,
    ) -> (Self, UnboundedReceiver<Frame>) {
        let (sender, receiver) = unbounded_channel();
        let connection = Self {
            session_id,
            user_id,
            driver_id: driver_id.into(),
            category,
            connected_at: Utc::now(),
            sender,
        };
        (connection, receiver)
    }

    pub fn send(&self, frame: Frame) -> Result<(), AppError> {
        self.sender
            .send(frame)
            .map_err(|_| AppError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Identity of a registered session, kept by the transport after the
/// [`Connection`] itself is owned by the registry.
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub session_id: SessionId,
    pub user_id: Uuid,
    pub driver_id: String,
    pub category: DeviceCategory,
}

impl From<&Connection> for SessionKey {
    fn from(conn: &Connection) -> Self {
        Self {
            session_id: conn.session_id,
            user_id: conn.user_id,
            driver_id: conn.driver_id.clone(),
            category: conn.category,
        }
    }
}
