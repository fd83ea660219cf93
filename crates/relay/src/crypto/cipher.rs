//! AES-256-GCM-SIV sealing and opening of record payloads and message keys.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant.
//! Payloads get a fresh random nonce on every call, so re-encrypting a record
//! after a retry yields a different but equally valid ciphertext. Message keys
//! use a synthetic nonce derived from the plaintext so that one group key always
//! seals to the same bytes and keeps its broker partition.
//!
//! **Do NOT substitute plain AES-256-GCM for the key path.** A plaintext-derived
//! nonce is only safe under a misuse-resistant mode.

use aes_gcm_siv::{
    aead::{Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::key::SessionKey;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Leading byte of every sealed value.
pub const VERSION: u8 = 0x01;

/// Domain separator mixed into synthetic nonces for message keys.
const KEY_NONCE_LABEL: &[u8] = b"relay.key";

type HmacSha256 = Hmac<Sha256>;

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The session key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKey(usize),

    /// AES-GCM-SIV encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// The sealed value does not have the `version || nonce || ciphertext` layout.
    #[error("malformed sealed value")]
    Malformed,

    /// Authentication failed (wrong key or tampered data).
    #[error("authentication failed")]
    AuthenticationFailed,
}

/// Encrypts and decrypts byte payloads under the single session key for a run.
///
/// Stateless beyond the key; safe to reuse across sequential calls.
pub struct Cipher {
    aead: Aes256GcmSiv,
    nonce_mac: HmacSha256,
}

impl Cipher {
    /// Build a cipher from the session key.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKey`] if the key is not [`KEY_LEN`] bytes.
    pub fn new(key: &SessionKey) -> Result<Self, CipherError> {
        let bytes = key.expose();
        if bytes.len() != KEY_LEN {
            return Err(CipherError::InvalidKey(bytes.len()));
        }
        let aead = Aes256GcmSiv::new_from_slice(bytes)
            .map_err(|_| CipherError::InvalidKey(bytes.len()))?;
        let nonce_mac = <HmacSha256 as Mac>::new_from_slice(bytes)
            .map_err(|_| CipherError::InvalidKey(bytes.len()))?;
        Ok(Self { aead, nonce_mac })
    }

    /// Seal `plaintext` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::EncryptionFailed`] on an internal AEAD error.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        use aes_gcm_siv::aead::rand_core::RngCore;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        self.seal(&nonce, plaintext)
    }

    /// Seal a message key so that equal inputs give equal outputs.
    ///
    /// The nonce is `HMAC-SHA256(session_key, label || plaintext)` truncated to
    /// [`NONCE_LEN`] bytes. The result opens with [`Cipher::decrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::EncryptionFailed`] on an internal AEAD error.
    pub fn encrypt_key(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut mac = self.nonce_mac.clone();
        mac.update(KEY_NONCE_LABEL);
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        self.seal(&nonce, plaintext)
    }

    /// Open a value produced by [`Cipher::encrypt`] or [`Cipher::encrypt_key`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Malformed`] if the layout is wrong and
    /// [`CipherError::AuthenticationFailed`] if the tag does not verify.
    #[allow(dead_code)] // consumer side; the pipeline only seals
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < 1 + NONCE_LEN + TAG_LEN || sealed[0] != VERSION {
            return Err(CipherError::Malformed);
        }
        let (nonce, ciphertext) = sealed[1..].split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::AuthenticationFailed)
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CipherError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(VERSION);
        out.extend_from_slice(nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_cipher() -> Cipher {
        use aes_gcm_siv::aead::rand_core::RngCore;
        let mut key = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Cipher::new(&SessionKey::new(key)).unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let cipher = random_cipher();
        for plaintext in [&b""[..], b"x", br#"{"customer_id":"A","t":1}"#] {
            let sealed = cipher.encrypt(plaintext).unwrap();
            assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn sealed_layout_has_version_nonce_and_tag() {
        let cipher = random_cipher();
        let sealed = cipher.encrypt(b"hello").unwrap();
        assert_eq!(sealed[0], VERSION);
        assert_eq!(sealed.len(), 1 + NONCE_LEN + 5 + TAG_LEN);
    }

    #[test]
    fn re_encryption_differs_but_both_open() {
        let cipher = random_cipher();
        let a = cipher.encrypt(b"retry me").unwrap();
        let b = cipher.encrypt(b"retry me").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), b"retry me");
        assert_eq!(cipher.decrypt(&b).unwrap(), b"retry me");
    }

    #[test]
    fn key_sealing_is_stable_per_input() {
        let cipher = random_cipher();
        let a1 = cipher.encrypt_key(b"cust-42").unwrap();
        let a2 = cipher.encrypt_key(b"cust-42").unwrap();
        let b = cipher.encrypt_key(b"cust-43").unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(cipher.decrypt(&a1).unwrap(), b"cust-42");
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let sealed = random_cipher().encrypt(b"secret").unwrap();
        assert!(matches!(
            random_cipher().decrypt(&sealed),
            Err(CipherError::AuthenticationFailed)
        ));
    }

    #[test]
    fn invalid_key_length_rejected() {
        let err = Cipher::new(&SessionKey::new(vec![0u8; 16])).unwrap_err();
        assert!(matches!(err, CipherError::InvalidKey(16)));
    }

    #[test]
    fn truncated_value_is_malformed() {
        let cipher = random_cipher();
        assert!(matches!(cipher.decrypt(&[VERSION; 8]), Err(CipherError::Malformed)));
    }

    #[test]
    fn unknown_version_is_malformed() {
        let cipher = random_cipher();
        let mut sealed = cipher.encrypt(b"x").unwrap();
        sealed[0] = 0x02;
        assert!(matches!(cipher.decrypt(&sealed), Err(CipherError::Malformed)));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let cipher = random_cipher();
        let mut sealed = cipher.encrypt(b"tamper me").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(cipher.decrypt(&sealed).is_err());
    }

    #[test]
    fn debug_is_redacted() {
        assert!(format!("{:?}", random_cipher()).contains("REDACTED"));
    }
}
