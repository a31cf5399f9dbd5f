//! Per-recipient sealing of outbound frames.
//!
//! Every frame leaving this service is encrypted for exactly one recipient.
//! The primitive sits behind [`Encryptor`] so deployments can swap the local
//! AES-256-GCM implementation for a remote key service.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload as AeadPayload},
    Aes256Gcm,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::AppError;
use crate::models::WsMsg;
use crate::websocket::Frame;

const ENVELOPE_VERSION: u8 = 1;
const ALGORITHM: &str = "A256GCM";
const NONCE_LEN: usize = 12;

#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Encrypt `plaintext` so that only `recipient` can read it.
    async fn seal(&self, plaintext: &[u8], recipient: Uuid) -> Result<Vec<u8>, AppError>;

    async fn unseal(&self, sealed: &[u8], recipient: Uuid) -> Result<Vec<u8>, AppError>;
}

/// Sealed frame as it travels over the socket.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    v: u8,
    alg: String,
    rcpt: Uuid,
    nonce: String,
    ct: String,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct MasterKey([u8; 32]);

/// AES-256-GCM with a key derived per recipient from a server master key
/// (HKDF-SHA256, recipient id as info). The recipient id is bound as AAD.
pub struct AesGcmEncryptor {
    master_key: MasterKey,
}

impl AesGcmEncryptor {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self {
            master_key: MasterKey(master_key),
        }
    }

    fn cipher_for(&self, recipient: Uuid) -> Result<Aes256Gcm, AppError> {
        let hk = Hkdf::<Sha256>::new(None, &self.master_key.0);
        let mut key = [0u8; 32];
        hk.expand(recipient.as_bytes(), &mut key)
            .map_err(|e| AppError::Encryption(format!("key derivation failed: {}", e)))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| AppError::Encryption(format!("invalid key: {}", e)));
        key.zeroize();
        cipher
    }
}

#[async_trait]
impl Encryptor for AesGcmEncryptor {
    async fn seal(&self, plaintext: &[u8], recipient: Uuid) -> Result<Vec<u8>, AppError> {
        let cipher = self.cipher_for(recipient)?;

        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| AppError::Encryption(format!("nonce generation failed: {}", e)))?;

        let ciphertext = cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                AeadPayload {
                    msg: plaintext,
                    aad: recipient.as_bytes(),
                },
            )
            .map_err(|e| AppError::Encryption(format!("encryption failed: {}", e)))?;

        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            alg: ALGORITHM.to_string(),
            rcpt: recipient,
            nonce: BASE64.encode(nonce),
            ct: BASE64.encode(ciphertext),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    async fn unseal(&self, sealed: &[u8], recipient: Uuid) -> Result<Vec<u8>, AppError> {
        let envelope: Envelope = serde_json::from_slice(sealed)?;
        if envelope.v != ENVELOPE_VERSION || envelope.alg != ALGORITHM {
            return Err(AppError::Encryption(format!(
                "unsupported envelope v{} {}",
                envelope.v, envelope.alg
            )));
        }
        if envelope.rcpt != recipient {
            return Err(AppError::Encryption(
                "envelope sealed for another recipient".into(),
            ));
        }

        let nonce = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| AppError::Encryption(format!("invalid nonce: {}", e)))?;
        if nonce.len() != NONCE_LEN {
            return Err(AppError::Encryption("invalid nonce length".into()));
        }
        let ciphertext = BASE64
            .decode(&envelope.ct)
            .map_err(|e| AppError::Encryption(format!("invalid ciphertext: {}", e)))?;

        let cipher = self.cipher_for(recipient)?;
        cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                AeadPayload {
                    msg: &ciphertext,
                    aad: recipient.as_bytes(),
                },
            )
            .map_err(|e| AppError::Encryption(format!("decryption failed: {}", e)))
    }
}

/// The only path by which outbound frames are produced.
///
/// A gate without an encryptor refuses to emit anything; plaintext never
/// reaches a socket.
#[derive(Clone, Default)]
pub struct EncryptionGate {
    encryptor: Option<Arc<dyn Encryptor>>,
}

impl EncryptionGate {
    pub fn new(encryptor: Arc<dyn Encryptor>) -> Self {
        Self {
            encryptor: Some(encryptor),
        }
    }

    pub fn disabled() -> Self {
        Self { encryptor: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.encryptor.is_some()
    }

    pub async fn seal(&self, plaintext: &[u8], recipient: Uuid) -> Result<Vec<u8>, AppError> {
        match &self.encryptor {
            Some(encryptor) => encryptor.seal(plaintext, recipient).await,
            None => Err(AppError::EncryptionUnavailable),
        }
    }

    /// Serialize and seal a message for its target user.
    pub async fn seal_msg(&self, msg: &WsMsg) -> Result<Frame, AppError> {
        if !self.is_enabled() {
            return Err(AppError::EncryptionUnavailable);
        }
        let plaintext = serde_json::to_vec(msg)?;
        let sealed = self.seal(&plaintext, msg.target_user_id).await?;
        Ok(Bytes::from(sealed))
    }
}
