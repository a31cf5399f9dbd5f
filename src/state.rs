use std::sync::Arc;

use crate::{
    config::{BrokerKind, Config},
    error::AppError,
    redis_client::RedisClient,
    services::{
        auth::{JwtVerifier, TokenVerifier},
        AesGcmEncryptor, EncryptionGate, Encryptor, HttpRelationClient, MemoryBroker,
        OfflineBroker, OfflineQueue, PresenceEngine, PushDispatcher, RedisStreamBroker,
        RelationService, StaticRelations, TaskGroup,
    },
    websocket::ConnectionRegistry,
};

/// External collaborators the service is assembled from.
pub struct Collaborators {
    pub broker: Arc<dyn OfflineBroker>,
    pub encryptor: Option<Arc<dyn Encryptor>>,
    pub relations: Arc<dyn RelationService>,
    pub verifier: Arc<dyn TokenVerifier>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ConnectionRegistry,
    pub presence: PresenceEngine,
    pub dispatcher: PushDispatcher,
    pub queue: OfflineQueue,
    pub verifier: Arc<dyn TokenVerifier>,
    pub tasks: TaskGroup,
}

impl AppState {
    /// Connect to the configured backends and assemble the service.
    pub async fn from_config(config: Config) -> Result<Self, AppError> {
        let broker: Arc<dyn OfflineBroker> = match config.offline_broker {
            BrokerKind::Redis => {
                let redis = RedisClient::from_url(&config.redis_url)
                    .await
                    .map_err(|e| AppError::StartServer(format!("redis: {e}")))?;
                Arc::new(RedisStreamBroker::new(redis))
            }
            BrokerKind::Memory => {
                tracing::warn!(
                    "using in-memory offline broker; queued messages do not survive restarts"
                );
                Arc::new(MemoryBroker::new())
            }
        };

        let encryptor = match config.encryption_master_key {
            Some(key) => Some(Arc::new(AesGcmEncryptor::new(key)) as Arc<dyn Encryptor>),
            None => {
                tracing::warn!("encryption disabled; every push will be refused");
                None
            }
        };

        let relations: Arc<dyn RelationService> = match &config.relation_service_url {
            Some(url) => Arc::new(HttpRelationClient::new(url.clone(), config.relation_timeout)?),
            None => {
                tracing::warn!(
                    "RELATION_SERVICE_URL not set; presence is not announced to friends"
                );
                Arc::new(StaticRelations::new())
            }
        };

        let verifier = Arc::new(JwtVerifier::from_rsa_pem(&config.jwt_public_key_pem)?);

        Ok(Self::with_collaborators(
            config,
            Collaborators {
                broker,
                encryptor,
                relations,
                verifier,
            },
        ))
    }

    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Self {
        let registry = ConnectionRegistry::new();
        let tasks = TaskGroup::new(config.fanout_max_concurrency);
        let gate = match collaborators.encryptor {
            Some(encryptor) => EncryptionGate::new(encryptor),
            None => EncryptionGate::disabled(),
        };
        let queue = OfflineQueue::new(collaborators.broker, config.offline_queue_prefix.clone());
        let dispatcher =
            PushDispatcher::new(registry.clone(), gate.clone(), queue.clone(), tasks.clone());
        let presence = PresenceEngine::new(
            registry.clone(),
            dispatcher.clone(),
            gate,
            queue.clone(),
            collaborators.relations,
            config.device_limit,
            tasks.clone(),
        );

        Self {
            config: Arc::new(config),
            registry,
            presence,
            dispatcher,
            queue,
            verifier: collaborators.verifier,
            tasks,
        }
    }

    /// Stop fan-out work and drop every session.
    pub async fn shutdown(&self) {
        tracing::info!(
            in_flight = self.tasks.in_flight(),
            "draining background tasks before shutdown"
        );
        self.tasks.shutdown(self.config.shutdown_grace).await;
        self.registry.reset().await;
    }
}
