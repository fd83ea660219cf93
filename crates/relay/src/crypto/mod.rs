//! AES-256-GCM-SIV record encryption.
//!
//! This module is intentionally free of AWS and broker dependencies.
//! A [`Cipher`] is built once per run from the [`SessionKey`](crate::key::SessionKey)
//! and shared read-only by the batch processor.
//!
//! # Sealed value format
//!
//! ```text
//! 0x01 || nonce (12 bytes) || ciphertext+tag
//! ```
//!
//! The leading version byte enables future algorithm migration without
//! breaking consumers of existing messages.

pub mod cipher;

pub use cipher::Cipher;
