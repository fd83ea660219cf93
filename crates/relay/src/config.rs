//! Configuration loading and validation for the relay.
//!
//! Values come from an optional YAML file (path in `RELAY_CONFIG_FILE`,
//! default `relay.yaml`) overlaid by environment variables prefixed `RELAY`
//! with `__` between sections, e.g. `RELAY_BROKER__ACKS=all`. The process
//! exits with a clear error message if anything required is missing or invalid.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

/// Environment variable naming the YAML configuration file.
pub const CONFIG_FILE_ENV: &str = "RELAY_CONFIG_FILE";

const DEFAULT_CONFIG_FILE: &str = "relay.yaml";

/// Compression codecs accepted by the broker.
const COMPRESSION_CODECS: [&str; 5] = ["none", "gzip", "snappy", "lz4", "zstd"];

/// Acknowledgment levels accepted by the broker.
const ACK_LEVELS: [&str; 4] = ["0", "1", "all", "-1"];

/// Validated relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP endpoint for spans and metrics. Logs only when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// AWS SDK overrides.
    #[serde(default)]
    pub aws: AwsConfig,

    /// Where the session key lives. **Required.**
    pub key: KeyConfig,

    /// Field names used to group and order records.
    #[serde(default)]
    pub records: RecordsConfig,

    /// S3 source of per-customer JSON batch files.
    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    /// Athena source for the date-partitioned table.
    #[serde(default)]
    pub table: TableConfig,

    /// Publishing behaviour. **Required** (for `topic`).
    pub publish: PublishConfig,

    /// Kafka producer options. **Required** (for `bootstrap_endpoints`).
    pub broker: BrokerConfig,
}

/// AWS SDK overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AwsConfig {
    /// Region; falls back to the SDK's default region chain.
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint override for every client (e.g. a local stack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

/// Location of the session key.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    /// Secrets Manager id or ARN holding the key. **Required.**
    pub secret_id: String,
    /// KMS key id; when set, the secret is an envelope decrypted through KMS.
    #[serde(default)]
    pub kms_key_id: Option<String>,
}

/// Field names used to group and order records.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordsConfig {
    /// Field holding the logical partition identity.
    #[serde(default = "default_group_key_field")]
    pub group_key_field: String,
    /// Field establishing emission order within a group.
    #[serde(default = "default_order_key_field")]
    pub order_key_field: String,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            group_key_field: default_group_key_field(),
            order_key_field: default_order_key_field(),
        }
    }
}

/// S3 source settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Whether to read batch files from S3.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bucket holding the batch files. **Required** when enabled.
    #[serde(default)]
    pub bucket: String,
    /// Key prefix under which batch files live.
    #[serde(default)]
    pub prefix: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket: String::new(),
            prefix: String::new(),
        }
    }
}

/// Athena source settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    /// Whether to query the table.
    #[serde(default)]
    pub enabled: bool,
    /// Glue/Athena database. **Required** when enabled.
    #[serde(default)]
    pub database: String,
    /// Table name. **Required** when enabled.
    #[serde(default)]
    pub table: String,
    /// Date partition column.
    #[serde(default = "default_partition_column")]
    pub partition_column: String,
    /// Partition to read; yesterday (UTC) when unset.
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
    /// Athena workgroup.
    #[serde(default = "default_workgroup")]
    pub workgroup: String,
    /// S3 location for query results; the workgroup default when unset.
    #[serde(default)]
    pub output_location: Option<String>,
    /// How often (milliseconds) to poll query state.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Longest time (milliseconds) to wait for a query to finish before
    /// stopping it and skipping the table source.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database: String::new(),
            table: String::new(),
            partition_column: default_partition_column(),
            target_date: None,
            workgroup: default_workgroup(),
            output_location: None,
            poll_interval_ms: default_poll_interval_ms(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl TableConfig {
    /// The partition date to read, defaulting to yesterday in UTC.
    pub fn resolved_date(&self) -> NaiveDate {
        self.target_date.unwrap_or_else(|| {
            let today = chrono::Utc::now().date_naive();
            today.pred_opt().unwrap_or(today)
        })
    }
}

/// Publishing behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    /// Destination topic. **Required.**
    pub topic: String,
    /// Total send attempts per record, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay (milliseconds) before the first retry; doubles on each further retry.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Seal message keys as well as values.
    #[serde(default = "default_true")]
    pub encrypt_keys: bool,
}

/// Kafka producer options.
///
/// Recognised options are explicit fields; anything else (e.g. TLS or SASL
/// settings) goes in `extra` and is passed to the client verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker `host:port` list. **Required.**
    pub bootstrap_endpoints: Vec<String>,
    /// Producer batch size in bytes.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Time (milliseconds) to wait for a batch to fill.
    #[serde(default)]
    pub linger_ms: u64,
    /// Compression codec (`none`, `gzip`, `snappy`, `lz4`, `zstd`).
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Acknowledgment level (`0`, `1`, `all`).
    #[serde(default = "default_acks")]
    pub acks: String,
    /// Producer buffer size in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Time (milliseconds) the broker client may spend delivering one message.
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// Extra client properties, passed through opaquely.
    #[serde(default, deserialize_with = "deserialize_properties")]
    pub extra: HashMap<String, String>,
}

/// Client property names owned by the explicit [`BrokerConfig`] fields.
pub const RECOGNISED_BROKER_PROPERTIES: [&str; 7] = [
    "bootstrap.servers",
    "batch.size",
    "linger.ms",
    "compression.type",
    "acks",
    "queue.buffering.max.kbytes",
    "message.timeout.ms",
];

/// The config loader splits keys on `.`, so `security.protocol: SSL` arrives
/// as a nested table. Join nested tables back into dotted property names.
fn deserialize_properties<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = HashMap::<String, serde_json::Value>::deserialize(deserializer)?;
    let mut out = HashMap::new();
    for (k, v) in raw {
        flatten_property(k, v, &mut out);
    }
    Ok(out)
}

fn flatten_property(key: String, value: serde_json::Value, out: &mut HashMap<String, String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                flatten_property(format!("{key}.{k}"), v, out);
            }
        }
        serde_json::Value::String(s) => {
            out.insert(key, s);
        }
        serde_json::Value::Null => {}
        other => {
            out.insert(key, other.to_string());
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_group_key_field() -> String {
    "customer_id".into()
}
fn default_order_key_field() -> String {
    "timestamp".into()
}
fn default_partition_column() -> String {
    "dt".into()
}
fn default_workgroup() -> String {
    "primary".into()
}
fn default_query_timeout_ms() -> u64 {
    600_000
}

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    16384
}
fn default_compression() -> String {
    "none".into()
}
fn default_acks() -> String {
    "all".into()
}
fn default_buffer_size() -> usize {
    33_554_432
}
fn default_message_timeout_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate configuration from the YAML file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable, a required value is absent,
    /// or any value fails validation.
    pub fn load() -> Result<Self> {
        let (path, required) = match std::env::var(CONFIG_FILE_ENV) {
            Ok(p) => (p, true),
            Err(_) => (DEFAULT_CONFIG_FILE.to_owned(), false),
        };

        let cfg = config::Config::builder()
            .add_source(
                config::File::new(&path, config::FileFormat::Yaml).required(required),
            )
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("broker.bootstrap_endpoints")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to build configuration from {path} and environment"))?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.key.secret_id, "key.secret_id")?;
        ensure_non_empty(&self.records.group_key_field, "records.group_key_field")?;
        ensure_non_empty(&self.records.order_key_field, "records.order_key_field")?;
        ensure_non_empty(&self.publish.topic, "publish.topic")?;

        if self.publish.max_attempts == 0 {
            anyhow::bail!("publish.max_attempts must be >= 1");
        }

        if !self.object_store.enabled && !self.table.enabled {
            anyhow::bail!("at least one of object_store.enabled or table.enabled must be true");
        }
        if self.object_store.enabled {
            ensure_non_empty(&self.object_store.bucket, "object_store.bucket")?;
        }
        if self.table.enabled {
            ensure_identifier(&self.table.database, "table.database")?;
            ensure_identifier(&self.table.table, "table.table")?;
            ensure_identifier(&self.table.partition_column, "table.partition_column")?;
            ensure_non_empty(&self.table.workgroup, "table.workgroup")?;
            if self.table.poll_interval_ms == 0 {
                anyhow::bail!("table.poll_interval_ms must be > 0");
            }
            if self.table.query_timeout_ms < self.table.poll_interval_ms {
                anyhow::bail!("table.query_timeout_ms must be at least table.poll_interval_ms");
            }
        }

        self.broker.validate()
    }
}

impl BrokerConfig {
    /// Validate recognised options and reject `extra` entries that shadow them.
    pub fn validate(&self) -> Result<()> {
        if self.bootstrap_endpoints.iter().all(|e| e.trim().is_empty()) {
            anyhow::bail!("broker.bootstrap_endpoints must list at least one host:port");
        }
        if !COMPRESSION_CODECS.contains(&self.compression.as_str()) {
            anyhow::bail!(
                "broker.compression must be one of {COMPRESSION_CODECS:?}, got {:?}",
                self.compression
            );
        }
        if !ACK_LEVELS.contains(&self.acks.as_str()) {
            anyhow::bail!("broker.acks must be one of {ACK_LEVELS:?}, got {:?}", self.acks);
        }
        if self.batch_size == 0 {
            anyhow::bail!("broker.batch_size must be > 0");
        }
        if self.buffer_size < 1024 {
            anyhow::bail!("broker.buffer_size must be at least 1024 bytes");
        }
        if self.message_timeout_ms == 0 {
            anyhow::bail!("broker.message_timeout_ms must be > 0");
        }
        if let Some(key) = self
            .extra
            .keys()
            .find(|k| RECOGNISED_BROKER_PROPERTIES.contains(&k.as_str()))
        {
            anyhow::bail!("broker.extra must not redefine recognised option {key:?}");
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

/// Table identifiers are interpolated into SQL, so only `[A-Za-z0-9_]` is allowed.
fn ensure_identifier(value: &str, name: &str) -> Result<()> {
    ensure_non_empty(value, name)?;
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!("{name} may only contain ASCII letters, digits and underscores");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn valid_broker() -> BrokerConfig {
        BrokerConfig {
            bootstrap_endpoints: vec!["localhost:9092".into()],
            batch_size: default_batch_size(),
            linger_ms: 5,
            compression: default_compression(),
            acks: default_acks(),
            buffer_size: default_buffer_size(),
            message_timeout_ms: default_message_timeout_ms(),
            extra: HashMap::new(),
        }
    }

    fn valid_config() -> Config {
        Config {
            log_level: default_log_level(),
            otel_exporter_otlp_endpoint: None,
            aws: AwsConfig::default(),
            key: KeyConfig {
                secret_id: "relay/session-key".into(),
                kms_key_id: None,
            },
            records: RecordsConfig::default(),
            object_store: ObjectStoreConfig {
                enabled: true,
                bucket: "customer-batches".into(),
                prefix: "batches/".into(),
            },
            table: TableConfig::default(),
            publish: PublishConfig {
                topic: "customer-events".into(),
                max_attempts: default_max_attempts(),
                retry_delay_ms: default_retry_delay_ms(),
                encrypt_keys: true,
            },
            broker: valid_broker(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_log_level(), "info");
        assert_eq!(default_max_attempts(), 3);
        assert_eq!(default_retry_delay_ms(), 1000);
        assert_eq!(default_acks(), "all");
        assert_eq!(default_partition_column(), "dt");
        assert_eq!(default_query_timeout_ms(), 600_000);
        assert!(ObjectStoreConfig::default().enabled);
        assert!(!TableConfig::default().enabled);
    }

    #[test]
    fn validate_accepts_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_secret_id() {
        let mut cfg = valid_config();
        cfg.key.secret_id = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut cfg = valid_config();
        cfg.publish.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_a_source() {
        let mut cfg = valid_config();
        cfg.object_store.enabled = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unsafe_table_identifier() {
        let mut cfg = valid_config();
        cfg.table = TableConfig {
            enabled: true,
            database: "analytics".into(),
            table: "events\"; DROP TABLE x; --".into(),
            ..TableConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_query_timeout_below_poll_interval() {
        let mut cfg = valid_config();
        cfg.table = TableConfig {
            enabled: true,
            database: "analytics".into(),
            table: "events".into(),
            poll_interval_ms: 1000,
            query_timeout_ms: 0,
            ..TableConfig::default()
        };
        assert!(cfg.validate().is_err());
        cfg.table.query_timeout_ms = 5000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_compression() {
        let mut broker = valid_broker();
        broker.compression = "brotli".into();
        assert!(broker.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_acks() {
        let mut broker = valid_broker();
        broker.acks = "some".into();
        assert!(broker.validate().is_err());
    }

    #[test]
    fn validate_rejects_extra_shadowing_recognised_option() {
        let mut broker = valid_broker();
        broker.extra.insert("acks".into(), "0".into());
        assert!(broker.validate().is_err());
    }

    #[test]
    fn validate_accepts_opaque_extra() {
        let mut broker = valid_broker();
        broker
            .extra
            .insert("security.protocol".into(), "SSL".into());
        assert!(broker.validate().is_ok());
    }

    #[test]
    fn resolved_date_prefers_configured_date() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let table = TableConfig {
            target_date: Some(date),
            ..TableConfig::default()
        };
        assert_eq!(table.resolved_date(), date);
    }

    #[test]
    fn resolved_date_defaults_to_yesterday() {
        let today = chrono::Utc::now().date_naive();
        let resolved = TableConfig::default().resolved_date();
        assert!(resolved < today);
    }

    #[test]
    fn yaml_file_deserialises() {
        let yaml = r#"
key:
  secret_id: relay/session-key
object_store:
  bucket: customer-batches
  prefix: batches/
publish:
  topic: customer-events
broker:
  bootstrap_endpoints: ["b1:9092", "b2:9092"]
  compression: zstd
  extra:
    security.protocol: SSL
    enable.idempotence: true
"#;
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.broker.bootstrap_endpoints.len(), 2);
        assert_eq!(cfg.broker.compression, "zstd");
        assert_eq!(cfg.publish.max_attempts, 3);
        assert_eq!(cfg.records.group_key_field, "customer_id");
        assert_eq!(
            cfg.broker.extra.get("security.protocol").map(String::as_str),
            Some("SSL")
        );
        assert_eq!(
            cfg.broker.extra.get("enable.idempotence").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn nested_properties_flatten_to_dotted_names() {
        let mut out = HashMap::new();
        let nested = serde_json::json!({"protocol": "SASL_SSL", "timeout": {"ms": 500}});
        flatten_property("security".into(), nested, &mut out);
        assert_eq!(out.get("security.protocol").map(String::as_str), Some("SASL_SSL"));
        assert_eq!(out.get("security.timeout.ms").map(String::as_str), Some("500"));
    }
}
