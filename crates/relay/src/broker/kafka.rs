//! Kafka implementation of [`Broker`] on top of rdkafka's `FutureProducer`.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use tracing::{debug, info};

use super::{Broker, BrokerError};
use crate::config::BrokerConfig;

/// How long [`Broker::flush`] and [`Broker::close`] wait for outstanding deliveries.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Kafka producer that waits for each delivery report before returning.
pub struct KafkaBroker {
    /// `None` once [`Broker::close`] has run.
    producer: Mutex<Option<FutureProducer>>,
}

impl KafkaBroker {
    /// Create a producer from the validated broker configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if librdkafka rejects the configuration.
    pub fn new(cfg: &BrokerConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = client_config(cfg)
            .create()
            .map_err(|e| BrokerError::Config(e.to_string()))?;
        info!(
            endpoints = %cfg.bootstrap_endpoints.join(","),
            acks = %cfg.acks,
            compression = %cfg.compression,
            "kafka producer created"
        );
        Ok(Self {
            producer: Mutex::new(Some(producer)),
        })
    }

    fn producer(&self) -> Result<FutureProducer, BrokerError> {
        self.producer
            .lock()
            .map_err(|_| BrokerError::Permanent("producer lock poisoned".into()))?
            .clone()
            .ok_or_else(|| BrokerError::Permanent("producer is closed".into()))
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<(), BrokerError> {
        let producer = self.producer()?;
        let record = FutureRecord::to(topic).key(key).payload(value);

        // A zero enqueue timeout surfaces local backpressure as QueueFull, which
        // the publisher retries with its own backoff.
        let (partition, offset) = producer
            .send(record, Timeout::After(Duration::ZERO))
            .await
            .map_err(|(err, _)| classify(&err))?;
        debug!(topic, partition, offset, "delivery acknowledged");
        Ok(())
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        let producer = self.producer()?;
        flush_blocking(producer).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let taken = self
            .producer
            .lock()
            .map_err(|_| BrokerError::Permanent("producer lock poisoned".into()))?
            .take();
        match taken {
            Some(producer) => {
                flush_blocking(producer).await?;
                info!("kafka producer closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// `Producer::flush` blocks the calling thread, so run it off the runtime.
async fn flush_blocking(producer: FutureProducer) -> Result<(), BrokerError> {
    tokio::task::spawn_blocking(move || producer.flush(Timeout::After(FLUSH_TIMEOUT)))
        .await
        .map_err(|e| BrokerError::Permanent(format!("flush task failed: {e}")))?
        .map_err(|e| classify(&e))
}

/// Translate the explicit broker options into librdkafka properties.
///
/// `extra` entries are applied last and verbatim; validation has already
/// rejected any that would shadow a recognised option.
pub fn client_config(cfg: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", cfg.bootstrap_endpoints.join(","))
        .set("batch.size", cfg.batch_size.to_string())
        .set("linger.ms", cfg.linger_ms.to_string())
        .set("compression.type", &cfg.compression)
        .set("acks", &cfg.acks)
        .set(
            "queue.buffering.max.kbytes",
            cfg.buffer_size.div_ceil(1024).to_string(),
        )
        .set("message.timeout.ms", cfg.message_timeout_ms.to_string());
    for (k, v) in &cfg.extra {
        client.set(k, v);
    }
    client
}

/// Map an rdkafka error onto the transient/permanent split.
pub fn classify(err: &KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(code) if is_transient_code(code) => BrokerError::Transient(err.to_string()),
        _ => BrokerError::Permanent(err.to_string()),
    }
}

fn is_transient_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::QueueFull
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerNotAvailable
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::NotEnoughReplicas
            | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_broker;

    fn production(code: RDKafkaErrorCode) -> KafkaError {
        KafkaError::MessageProduction(code)
    }

    #[test]
    fn backpressure_and_timeouts_are_transient() {
        for code in [
            RDKafkaErrorCode::QueueFull,
            RDKafkaErrorCode::MessageTimedOut,
            RDKafkaErrorCode::RequestTimedOut,
            RDKafkaErrorCode::NetworkException,
            RDKafkaErrorCode::NotLeaderForPartition,
        ] {
            assert!(
                matches!(classify(&production(code)), BrokerError::Transient(_)),
                "{code:?}"
            );
        }
    }

    #[test]
    fn auth_and_topic_errors_are_permanent() {
        for code in [
            RDKafkaErrorCode::TopicAuthorizationFailed,
            RDKafkaErrorCode::SaslAuthenticationFailed,
            RDKafkaErrorCode::UnknownTopicOrPartition,
            RDKafkaErrorCode::MessageSizeTooLarge,
            RDKafkaErrorCode::InvalidMessage,
        ] {
            assert!(
                matches!(classify(&production(code)), BrokerError::Permanent(_)),
                "{code:?}"
            );
        }
    }

    #[test]
    fn errors_without_code_are_permanent() {
        let err = KafkaError::ClientCreation("bad config".into());
        assert!(matches!(classify(&err), BrokerError::Permanent(_)));
    }

    #[test]
    fn client_config_maps_recognised_options() {
        let mut cfg = valid_broker();
        cfg.bootstrap_endpoints = vec!["b1:9092".into(), "b2:9092".into()];
        cfg.compression = "lz4".into();
        cfg.buffer_size = 1_500_000;
        let client = client_config(&cfg);
        assert_eq!(client.get("bootstrap.servers"), Some("b1:9092,b2:9092"));
        assert_eq!(client.get("compression.type"), Some("lz4"));
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("linger.ms"), Some("5"));
        assert_eq!(client.get("queue.buffering.max.kbytes"), Some("1465"));
    }

    #[test]
    fn client_config_passes_extra_through() {
        let mut cfg = valid_broker();
        cfg.extra.insert("security.protocol".into(), "SSL".into());
        cfg.extra
            .insert("ssl.ca.location".into(), "/etc/ssl/ca.pem".into());
        let client = client_config(&cfg);
        assert_eq!(client.get("security.protocol"), Some("SSL"));
        assert_eq!(client.get("ssl.ca.location"), Some("/etc/ssl/ca.pem"));
    }
}
