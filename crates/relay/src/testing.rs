//! Test doubles shared by the publisher, batch and driver tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::broker::{Broker, BrokerError};
use crate::crypto::Cipher;
use crate::key::SessionKey;

/// One `send` call observed by [`RecordingBroker`], successful or not.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub topic: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub at: Instant,
    pub result: Result<(), BrokerError>,
}

/// Broker that replays a script of send results and records every call.
///
/// Once the script runs out every send succeeds.
#[derive(Default)]
pub struct RecordingBroker {
    script: Mutex<VecDeque<Result<(), BrokerError>>>,
    sent: Mutex<Vec<SentMessage>>,
    flushes: Mutex<u32>,
    closed: Mutex<bool>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(results: impl IntoIterator<Item = Result<(), BrokerError>>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Messages the broker acknowledged, in acknowledgment order.
    pub fn delivered(&self) -> Vec<SentMessage> {
        self.sent().into_iter().filter(|m| m.result.is_ok()).collect()
    }

    pub fn flushes(&self) -> u32 {
        *self.flushes.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), BrokerError> {
        let result = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        self.sent.lock().unwrap().push(SentMessage {
            topic: topic.to_owned(),
            key: key.to_vec(),
            value: value.to_vec(),
            at: Instant::now(),
            result: result.clone(),
        });
        result
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        *self.flushes.lock().unwrap() += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

pub fn test_key() -> SessionKey {
    SessionKey::new((0u8..32).collect())
}

pub fn test_cipher() -> Cipher {
    Cipher::new(&test_key()).unwrap()
}

/// Decrypt a published value back into its JSON record.
pub fn open_value(cipher: &Cipher, sealed: &[u8]) -> Value {
    serde_json::from_slice(&cipher.decrypt(sealed).unwrap()).unwrap()
}

/// Decrypt a published key back into the group key.
pub fn open_key(cipher: &Cipher, sealed: &[u8]) -> String {
    String::from_utf8(cipher.decrypt(sealed).unwrap()).unwrap()
}
