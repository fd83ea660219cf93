//! Ordered publishing of one source unit.
//!
//! Records are resolved to a group key and an order key, stable-sorted by
//! order key across the whole unit, then encrypted and published one at a
//! time. Since every publish waits for acknowledgment and the sort is stable,
//! the publish calls seen for any one group key are non-decreasing in order
//! key, with equal keys kept in decode order.

use common::{PipelineError, PublishOutcome, RecordOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::BrokerError;
use crate::config::Config;
use crate::crypto::Cipher;
use crate::publisher::Publisher;
use crate::source::{OrderKey, Record, SourceUnit};
use crate::telemetry::PipelineMetrics;

/// Per-run settings the processor needs from configuration.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub topic: String,
    pub group_key_field: String,
    pub order_key_field: String,
    /// Seal group keys before using them as message keys.
    pub encrypt_keys: bool,
}

impl BatchSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            topic: cfg.publish.topic.clone(),
            group_key_field: cfg.records.group_key_field.clone(),
            order_key_field: cfg.records.order_key_field.clone(),
            encrypt_keys: cfg.publish.encrypt_keys,
        }
    }
}

/// A record with both keys resolved, waiting to be published.
struct Keyed {
    record: Record,
    group_key: String,
    order_key: OrderKey,
}

/// Turns source units into ordered, encrypted publish calls.
pub struct OrderedBatchProcessor {
    cipher: Cipher,
    publisher: Publisher,
    settings: BatchSettings,
    metrics: PipelineMetrics,
}

impl OrderedBatchProcessor {
    pub fn new(
        cipher: Cipher,
        publisher: Publisher,
        settings: BatchSettings,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            cipher,
            publisher,
            settings,
            metrics,
        }
    }

    /// Publish every record of `unit` and return one outcome per decoded record.
    ///
    /// Cancellation is checked before each record; records not yet published
    /// when `cancel` fires are returned as `Skipped`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnitDecode`] if the unit cannot be decoded. No
    /// record of such a unit is published.
    pub async fn process(
        &self,
        unit: SourceUnit,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecordOutcome>, PipelineError> {
        let unit_id = unit.id.clone();
        let hint = unit.group_hint.clone();
        let records = unit.decode().map_err(|e| PipelineError::UnitDecode {
            unit_id: unit_id.clone(),
            reason: e.to_string(),
        })?;
        debug!(unit_id = %unit_id, records = records.len(), "unit decoded");

        let mut outcomes = Vec::with_capacity(records.len());
        let mut keyed = Vec::with_capacity(records.len());
        for record in records {
            let group_key = record.group_key(&self.settings.group_key_field, hint.as_deref());
            let order_key = record.order_key(&self.settings.order_key_field);
            match (group_key, order_key) {
                (Some(group_key), Some(order_key)) => keyed.push(Keyed {
                    record,
                    group_key,
                    order_key,
                }),
                (group_key, _) => {
                    let missing = if group_key.is_none() {
                        &self.settings.group_key_field
                    } else {
                        &self.settings.order_key_field
                    };
                    warn!(
                        unit_id = %unit_id,
                        position = record.position,
                        field = %missing,
                        "record skipped: key field missing"
                    );
                    outcomes.push(self.finish(
                        &unit_id,
                        record.position,
                        group_key,
                        PublishOutcome::skipped(format!("missing {missing}")),
                    ));
                }
            }
        }

        // `sort_by` is stable: equal order keys keep decode order.
        keyed.sort_by(|a, b| a.order_key.cmp(&b.order_key));

        for item in keyed {
            let outcome = if cancel.is_cancelled() {
                PublishOutcome::skipped("cancelled")
            } else {
                self.publish_record(&unit_id, &item).await
            };
            outcomes.push(self.finish(&unit_id, item.record.position, Some(item.group_key), outcome));
        }
        Ok(outcomes)
    }

    /// Flush and close the broker behind the publisher.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.publisher.shutdown().await
    }

    async fn publish_record(&self, unit_id: &str, item: &Keyed) -> PublishOutcome {
        let sealed = serde_json::to_vec(&item.record.fields)
            .map_err(|e| PipelineError::EncryptionFailed(format!("serialise record: {e}")))
            .and_then(|plain| {
                self.cipher
                    .encrypt(&plain)
                    .map_err(|e| PipelineError::EncryptionFailed(e.to_string()))
            });
        let value = match sealed {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    unit_id,
                    position = item.record.position,
                    group_key = %item.group_key,
                    error = %e,
                    "record not published"
                );
                return PublishOutcome::failed(0, e.to_string());
            }
        };

        let key = if self.settings.encrypt_keys {
            match self.cipher.encrypt_key(item.group_key.as_bytes()) {
                Ok(k) => k,
                Err(e) => {
                    let e = PipelineError::EncryptionFailed(e.to_string());
                    warn!(unit_id, group_key = %item.group_key, error = %e, "record not published");
                    return PublishOutcome::failed(0, e.to_string());
                }
            }
        } else {
            item.group_key.as_bytes().to_vec()
        };

        let outcome = self.publisher.publish(&self.settings.topic, &key, &value).await;
        if !outcome.is_delivered() {
            warn!(
                unit_id,
                position = item.record.position,
                group_key = %item.group_key,
                attempts = outcome.attempts,
                reason = outcome.reason.as_deref().unwrap_or_default(),
                "record failed"
            );
        }
        outcome
    }

    fn finish(
        &self,
        unit_id: &str,
        position: usize,
        group_key: Option<String>,
        outcome: PublishOutcome,
    ) -> RecordOutcome {
        self.metrics.record_outcome(outcome.status, outcome.attempts);
        RecordOutcome {
            unit_id: unit_id.to_owned(),
            position,
            group_key,
            outcome,
        }
    }
}
