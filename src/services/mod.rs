pub mod auth;
pub mod dispatcher;
pub mod encryption;
pub mod fanout;
pub mod offline_queue;
pub mod presence;
pub mod relation_client;

pub use dispatcher::{BatchReport, PushDispatcher, PushOutcome};
pub use encryption::{AesGcmEncryptor, EncryptionGate, Encryptor};
pub use fanout::TaskGroup;
pub use offline_queue::{MemoryBroker, OfflineBroker, OfflineQueue, RedisStreamBroker};
pub use presence::{PresenceEngine, PresenceSnapshot, SessionHandle};
pub use relation_client::{HttpRelationClient, RelationService, StaticRelations};
