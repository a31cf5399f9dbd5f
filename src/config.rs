use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::websocket::session::Heartbeat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Redis,
    Memory,
}

impl FromStr for BrokerKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(BrokerKind::Redis),
            "memory" => Ok(BrokerKind::Memory),
            other => Err(AppError::Config(format!("unknown OFFLINE_BROKER: {other}"))),
        }
    }
}

/// Per-partition session cap. When disabled any number of devices of one
/// category may be online at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimitConfig {
    pub enabled: bool,
    pub max_sessions: usize,
}

impl DeviceLimitConfig {
    pub fn unlimited() -> Self {
        Self {
            enabled: false,
            max_sessions: usize::MAX,
        }
    }

    pub fn max(max_sessions: usize) -> Self {
        Self {
            enabled: true,
            max_sessions,
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.enabled.then_some(self.max_sessions)
    }
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub offline_broker: BrokerKind,
    pub offline_queue_prefix: String,
    pub device_limit: DeviceLimitConfig,
    /// `None` when encryption is disabled; every outbound frame is then refused.
    pub encryption_master_key: Option<[u8; 32]>,
    pub relation_service_url: Option<String>,
    pub relation_timeout: Duration,
    pub jwt_public_key_pem: String,
    pub heartbeat: Heartbeat,
    pub fanout_max_concurrency: usize,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup (the process environment in
    /// production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_or = |key: &str, default: u64| -> Result<u64, AppError> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|e| AppError::Config(format!("{key}: {e}"))),
                None => Ok(default),
            }
        };
        let flag = |key: &str, default: bool| -> bool {
            lookup(key)
                .map(|v| {
                    matches!(
                        v.trim().to_ascii_lowercase().as_str(),
                        "1" | "true" | "yes" | "on"
                    )
                })
                .unwrap_or(default)
        };

        let port = parse_or("PORT", 8080)?;
        let port = u16::try_from(port).map_err(|e| AppError::Config(format!("PORT: {e}")))?;
        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into());
        let offline_broker = match lookup("OFFLINE_BROKER") {
            Some(raw) => raw.parse()?,
            None => BrokerKind::Redis,
        };
        let offline_queue_prefix =
            lookup("OFFLINE_QUEUE_PREFIX").unwrap_or_else(|| "offline:queue".into());

        let device_limit = if flag("MULTI_DEVICE_LIMIT_ENABLED", false) {
            let max_sessions = parse_or("MULTI_DEVICE_MAX_SESSIONS", 1)? as usize;
            if max_sessions == 0 {
                return Err(AppError::Config(
                    "MULTI_DEVICE_MAX_SESSIONS must be at least 1".into(),
                ));
            }
            DeviceLimitConfig::max(max_sessions)
        } else {
            DeviceLimitConfig::unlimited()
        };

        let encryption_master_key = if flag("ENCRYPTION_ENABLED", true) {
            let master_key_env = lookup("ENCRYPTION_MASTER_KEY").ok_or_else(|| {
                AppError::Config("ENCRYPTION_MASTER_KEY missing (ENCRYPTION_ENABLED=true)".into())
            })?;
            let master_key_bytes = STANDARD
                .decode(master_key_env.trim().as_bytes())
                .map_err(|e| AppError::Config(format!("ENCRYPTION_MASTER_KEY decode: {e}")))?;
            if master_key_bytes.len() != 32 {
                return Err(AppError::Config(
                    "ENCRYPTION_MASTER_KEY must be 32 bytes".into(),
                ));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&master_key_bytes);
            Some(key)
        } else {
            None
        };

        let relation_service_url = lookup("RELATION_SERVICE_URL").filter(|s| !s.trim().is_empty());
        let relation_timeout = Duration::from_millis(parse_or("RELATION_TIMEOUT_MS", 500)?);

        let jwt_public_key_pem = lookup("JWT_PUBLIC_KEY_PEM")
            .map(|pem| pem.replace("\\n", "\n"))
            .ok_or_else(|| AppError::Config("JWT_PUBLIC_KEY_PEM missing".into()))?;

        let heartbeat = Heartbeat {
            interval: Duration::from_secs(parse_or("WS_HEARTBEAT_INTERVAL_SECS", 5)?),
            client_timeout: Duration::from_secs(parse_or("WS_CLIENT_TIMEOUT_SECS", 30)?),
        };
        if heartbeat.interval.is_zero() || heartbeat.client_timeout <= heartbeat.interval {
            return Err(AppError::Config(
                "WS_CLIENT_TIMEOUT_SECS must exceed a non-zero WS_HEARTBEAT_INTERVAL_SECS".into(),
            ));
        }

        let fanout_max_concurrency = parse_or("FANOUT_MAX_CONCURRENCY", 256)?.max(1) as usize;
        let shutdown_grace = Duration::from_secs(parse_or("SHUTDOWN_GRACE_SECS", 10)?);

        Ok(Self {
            port,
            redis_url,
            offline_broker,
            offline_queue_prefix,
            device_limit,
            encryption_master_key,
            relation_service_url,
            relation_timeout,
            jwt_public_key_pem,
            heartbeat,
            fanout_max_concurrency,
            shutdown_grace,
        })
    }
}
