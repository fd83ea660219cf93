//! Keyed publishing with bounded retry and exponential backoff.
//!
//! # Ordering
//!
//! [`Publisher::publish`] returns only after the broker acknowledged the
//! message or the attempt budget is spent. Backoff sleeps happen inside the
//! call, so the caller cannot advance to the next record of a group while an
//! earlier one is still outstanding.

use std::sync::Arc;
use std::time::Duration;

use common::{PipelineError, PublishOutcome};
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError};
use crate::config::PublishConfig;

/// Attempt budget and initial backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per record, including the first. Never less than 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled before each further attempt.
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &PublishConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }

    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_delay.saturating_mul(1u32 << exp)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

/// Sends encrypted payloads to one broker handle.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        Self { broker, policy }
    }

    /// Publish one message, retrying transient failures.
    ///
    /// Never returns an error: every failure is folded into a
    /// [`PublishOutcome`] carrying the attempts consumed.
    pub async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> PublishOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.broker.send(topic, key, payload).await {
                Ok(()) => {
                    debug!(topic, attempts = attempt, "record delivered");
                    return PublishOutcome::delivered(attempt);
                }
                Err(e) => to_pipeline_error(e),
            };

            if err.is_transient() && attempt < self.policy.max_attempts {
                let delay = self.policy.delay_after(attempt);
                warn!(
                    topic,
                    attempts = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient publish failure; retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            warn!(topic, attempts = attempt, error = %err, "publish failed");
            return PublishOutcome::failed(attempt, err.to_string());
        }
    }

    /// Flush outstanding deliveries and release the broker connection.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if the final flush or close fails.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.broker.flush().await?;
        self.broker.close().await
    }
}

fn to_pipeline_error(err: BrokerError) -> PipelineError {
    match err {
        BrokerError::Transient(msg) => PipelineError::TransientPublish(msg),
        BrokerError::Permanent(msg) | BrokerError::Config(msg) => {
            PipelineError::PermanentPublish(msg)
        }
    }
}
