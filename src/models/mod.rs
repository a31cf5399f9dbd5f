pub mod device;
pub mod ws_msg;

pub use device::DeviceCategory;
pub use ws_msg::{FriendStatus, Payload, PresenceStatus, SessionId, WsEvent, WsMsg};
