use crate::error::AppError;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const JWT_ALGORITHM: Algorithm = Algorithm::RS256;
const DEFAULT_DRIVER_ID: &str = "default";

/// Access token claims. `driver_id` identifies the physical device and is
/// stable across reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub driver_id: Option<String>,
}

/// Identity established by a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedDevice {
    pub user_id: Uuid,
    pub driver_id: String,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthenticatedDevice, AppError>;
}

/// RS256 verification against the identity provider's public key.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn from_rsa_pem(public_key_pem: &str) -> Result<Self, AppError> {
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| AppError::Config(format!("Invalid JWT public key: {}", e)))?;

        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.validate_exp = true;

        Ok(Self {
            decoding_key,
            validation,
        })
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<AuthenticatedDevice, AppError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "token validation failed");
            AppError::Unauthorized
        })?;

        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| AppError::Unauthorized)?;
        let driver_id = data
            .claims
            .driver_id
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_DRIVER_ID.to_string());

        Ok(AuthenticatedDevice { user_id, driver_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/jwt_test_private.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/jwt_test_public.pem");

    fn token(sub: &str, driver_id: Option<&str>, exp_offset: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            iat: now,
            exp: now + exp_offset,
            driver_id: driver_id.map(str::to_string),
        };
        let key = EncodingKey::from_rsa_pem(PRIVATE_KEY.as_bytes()).unwrap();
        encode(&Header::new(JWT_ALGORITHM), &claims, &key).unwrap()
    }

    #[tokio::test]
    async fn test_valid_token() {
        let verifier = JwtVerifier::from_rsa_pem(PUBLIC_KEY).unwrap();
        let user_id = Uuid::new_v4();

        let device = verifier
            .verify(&token(&user_id.to_string(), Some("iphone-1"), 3600))
            .await
            .unwrap();

        assert_eq!(device.user_id, user_id);
        assert_eq!(device.driver_id, "iphone-1");
    }

    #[tokio::test]
    async fn test_missing_driver_falls_back_to_default() {
        let verifier = JwtVerifier::from_rsa_pem(PUBLIC_KEY).unwrap();
        let device = verifier
            .verify(&token(&Uuid::new_v4().to_string(), None, 3600))
            .await
            .unwrap();
        assert_eq!(device.driver_id, DEFAULT_DRIVER_ID);
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let verifier = JwtVerifier::from_rsa_pem(PUBLIC_KEY).unwrap();
        let err = verifier
            .verify(&token(&Uuid::new_v4().to_string(), None, -3600))
            .await
            .unwrap_err();
        assert_eq!(err, AppError::Unauthorized);
    }

    #[tokio::test]
    async fn test_non_uuid_subject_rejected() {
        let verifier = JwtVerifier::from_rsa_pem(PUBLIC_KEY).unwrap();
        let err = verifier
            .verify(&token("not-a-uuid", None, 3600))
            .await
            .unwrap_err();
        assert_eq!(err, AppError::Unauthorized);
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        let verifier = JwtVerifier::from_rsa_pem(PUBLIC_KEY).unwrap();
        assert!(verifier.verify("garbage").await.is_err());
    }

    #[test]
    fn test_invalid_public_key() {
        assert!(matches!(
            JwtVerifier::from_rsa_pem("not a pem"),
            Err(AppError::Config(_))
        ));
    }
}
