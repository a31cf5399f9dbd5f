use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    /// The user already holds the maximum number of sessions in this partition.
    #[error("login devices exceed limit (max {max})")]
    DeviceLimitExceeded { max: usize },

    /// Sealing was requested but no encryptor is configured. Never downgraded
    /// to plaintext.
    #[error("encryption unavailable")]
    EncryptionUnavailable,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("offline queue broker error: {0}")]
    Broker(String),

    #[error("relation service error: {0}")]
    Relation(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("internal server error")]
    Internal,
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Broker(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Serialization(e.to_string())
    }
}

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) | AppError::Serialization(_) => 400,
            AppError::Unauthorized => 401,
            AppError::DeviceLimitExceeded { .. } => 403,
            AppError::Relation(_) => 502,
            AppError::EncryptionUnavailable | AppError::Broker(_) => 503,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
                "INTERNAL_SERVER_ERROR"
            }
            AppError::BadRequest(_) => "INVALID_REQUEST",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::DeviceLimitExceeded { .. } => "DEVICE_LIMIT_EXCEEDED",
            AppError::EncryptionUnavailable => "ENCRYPTION_UNAVAILABLE",
            AppError::Encryption(_) => "ENCRYPTION_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Broker(_) => "BROKER_ERROR",
            AppError::Relation(_) => "RELATION_SERVICE_ERROR",
            AppError::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message: self.to_string(),
            status: status.as_u16(),
            code: self.error_code().to_string(),
        }
    }
}

/// JSON body returned for every failed HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub code: String,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(ResponseError::status_code(self)).json(self.to_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_limit_maps_to_forbidden_with_login_message() {
        let err = AppError::DeviceLimitExceeded { max: 1 };
        assert_eq!(err.status_code(), 403);

        let body = err.to_response();
        assert_eq!(body.code, "DEVICE_LIMIT_EXCEEDED");
        assert!(body.message.contains("login devices exceed limit"));
    }

    #[test]
    fn unavailable_backends_map_to_service_unavailable() {
        assert_eq!(AppError::Broker("io".into()).status_code(), 503);
        assert_eq!(AppError::EncryptionUnavailable.status_code(), 503);
        assert_eq!(AppError::Relation("timeout".into()).status_code(), 502);
    }
}
