//! Session key retrieval from Secrets Manager, with optional KMS envelope decryption.
//!
//! # Lifecycle
//!
//! 1. At startup the driver calls [`KeyProvider::fetch_key`] exactly once.
//! 2. The key is read from AWS Secrets Manager. Binary secrets are used as-is;
//!    string secrets are base64-decoded.
//! 3. If a KMS key id is configured, the secret is an envelope and is decrypted
//!    via AWS KMS before use.
//! 4. The resulting [`SessionKey`] is handed to [`Cipher::new`](crate::crypto::Cipher::new)
//!    and dropped (zeroed) as soon as the cipher is built.
//!
//! # Security invariants
//!
//! - The plaintext key is **never** written to disk, logged, or included in traces.
//! - The key is never derived or transmitted; it is used as supplied.

pub mod session;

pub use session::SessionKey;

use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::aws::AwsClients;
use crate::config::KeyConfig;

/// Errors produced while fetching the session key.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The secret store could not be reached or refused the request.
    #[error("failed to fetch secret: {0}")]
    Fetch(String),

    /// The secret exists but holds nothing usable.
    #[error("secret has no usable value: {0}")]
    Empty(String),

    /// A string secret was not valid base64.
    #[error("secret string is not valid base64")]
    Encoding,

    /// KMS refused to decrypt the envelope.
    #[error("failed to decrypt key envelope via KMS: {0}")]
    Envelope(String),
}

/// Supplies the single symmetric key for a run.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Retrieve the key. Called once at startup.
    async fn fetch_key(&self) -> Result<SessionKey, KeyError>;
}

/// [`KeyProvider`] backed by AWS Secrets Manager and, optionally, AWS KMS.
pub struct SecretsManagerKeyProvider {
    aws: AwsClients,
    cfg: KeyConfig,
}

impl SecretsManagerKeyProvider {
    /// Create a provider reading the secret named in `cfg`.
    pub fn new(aws: AwsClients, cfg: KeyConfig) -> Self {
        Self { aws, cfg }
    }
}

#[async_trait]
impl KeyProvider for SecretsManagerKeyProvider {
    async fn fetch_key(&self) -> Result<SessionKey, KeyError> {
        let resp = self
            .aws
            .secretsmanager
            .get_secret_value()
            .secret_id(&self.cfg.secret_id)
            .send()
            .await
            .map_err(|e| KeyError::Fetch(e.into_service_error().to_string()))?;

        let secret = secret_bytes(
            resp.secret_binary().map(|b| b.as_ref()),
            resp.secret_string(),
        )?;

        let key = match &self.cfg.kms_key_id {
            None => secret,
            Some(kms_key_id) => {
                // The secret is the ciphertext envelope here, so copying it out is safe.
                let mut decrypted = self
                    .aws
                    .kms
                    .decrypt()
                    .key_id(kms_key_id)
                    .ciphertext_blob(Blob::new(secret.expose().to_vec()))
                    .send()
                    .await
                    .map_err(|e| KeyError::Envelope(e.into_service_error().to_string()))?;
                let plaintext = decrypted.plaintext.take().ok_or_else(|| {
                    KeyError::Envelope("KMS decrypt response contained no plaintext".into())
                })?;
                SessionKey::new(plaintext.into_inner())
            }
        };

        if key.is_empty() {
            return Err(KeyError::Empty(self.cfg.secret_id.clone()));
        }

        info!(
            key_len = key.len(),
            enveloped = self.cfg.kms_key_id.is_some(),
            "session key fetched"
        );
        Ok(key)
    }
}

/// Pick the key bytes out of a Secrets Manager response.
///
/// Binary secrets win over string secrets. String secrets are trimmed and
/// decoded as standard base64. Every buffer holding key bytes is a
/// [`SessionKey`] from the moment it exists.
fn secret_bytes(binary: Option<&[u8]>, string: Option<&str>) -> Result<SessionKey, KeyError> {
    if let Some(bytes) = binary.filter(|b| !b.is_empty()) {
        return Ok(SessionKey::new(bytes.to_vec()));
    }
    match string.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => STANDARD
            .decode(s)
            .map(SessionKey::new)
            .map_err(|_| KeyError::Encoding),
        None => Err(KeyError::Empty("neither binary nor string value set".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_secret_used_verbatim() {
        let key = secret_bytes(Some(&[7u8; 32]), Some("ignored")).unwrap();
        assert_eq!(key.expose(), [7u8; 32]);
    }

    #[test]
    fn string_secret_is_base64_decoded() {
        let encoded = STANDARD.encode([0x42u8; 32]);
        let key = secret_bytes(None, Some(&format!("  {encoded}\n"))).unwrap();
        assert_eq!(key.expose(), [0x42u8; 32]);
    }

    #[test]
    fn empty_binary_falls_back_to_string() {
        let encoded = STANDARD.encode(b"abc");
        assert_eq!(secret_bytes(Some(&[]), Some(&encoded)).unwrap().expose(), b"abc");
    }

    #[test]
    fn bad_base64_rejected() {
        assert!(matches!(
            secret_bytes(None, Some("not base64!!")),
            Err(KeyError::Encoding)
        ));
    }

    #[test]
    fn missing_value_rejected() {
        assert!(matches!(secret_bytes(None, None), Err(KeyError::Empty(_))));
        assert!(matches!(secret_bytes(None, Some("   ")), Err(KeyError::Empty(_))));
    }
}
