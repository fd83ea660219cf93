//! Message broker seam.
//!
//! The pipeline only needs three operations from the broker: send one keyed
//! message and wait for its acknowledgment, flush, and close. Keys and values
//! are raw bytes (ciphertext); topics and partition counts are managed
//! elsewhere.
//!
//! # Ordering contract
//!
//! [`Broker::send`] must not return `Ok` until the broker has acknowledged the
//! message. The publisher relies on this per-record blocking acknowledgment to
//! keep records of one group in order. An implementation that batches sends
//! asynchronously must add its own per-key sequencing barrier.

pub mod kafka;

pub use kafka::KafkaBroker;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Errors produced by a broker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The send may succeed if retried (timeout, backpressure, leader change).
    #[error("transient broker failure: {0}")]
    Transient(String),

    /// The send cannot succeed on retry (authorisation, unknown topic, bad record).
    #[error("permanent broker failure: {0}")]
    Permanent(String),

    /// The client could not be created from the configuration.
    #[error("broker configuration rejected: {0}")]
    Config(String),
}

/// A single-writer handle to the message broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Send one message and wait for the broker's acknowledgment.
    async fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), BrokerError>;

    /// Wait for every outstanding message to be acknowledged.
    async fn flush(&self) -> Result<(), BrokerError>;

    /// Flush and release the connection.
    async fn close(&self) -> Result<(), BrokerError>;
}
