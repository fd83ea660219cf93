//! `relay` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from the YAML file and environment.
//! 2. Initialise the telemetry pipeline (tracing + optional OTLP).
//! 3. Initialise AWS SDK clients and the collaborators built on them.
//! 4. Create the Kafka producer.
//! 5. Run the [`PipelineDriver`] once, cancellable with Ctrl-C.
//! 6. Print the run summary as one JSON line and flush telemetry.

mod aws;
mod batch;
mod broker;
mod config;
mod crypto;
mod driver;
mod key;
mod publisher;
mod source;
mod telemetry;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use common::Summary;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::Config;
use driver::{DriverSettings, PipelineDriver};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::load().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    let telemetry =
        telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        topic = %cfg.publish.topic,
        object_store = cfg.object_store.enabled,
        table = cfg.table.enabled,
        "relay starting"
    );

    // -----------------------------------------------------------------------
    // 3. AWS clients and collaborators
    // -----------------------------------------------------------------------
    let aws = aws::AwsClients::init(&cfg.aws).await;
    let key_provider = Arc::new(key::SecretsManagerKeyProvider::new(
        aws.clone(),
        cfg.key.clone(),
    ));

    // -----------------------------------------------------------------------
    // 4. Broker
    // -----------------------------------------------------------------------
    let broker = Arc::new(
        broker::KafkaBroker::new(&cfg.broker).context("failed to create kafka producer")?,
    );

    // -----------------------------------------------------------------------
    // 5. Run
    // -----------------------------------------------------------------------
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let mut driver = PipelineDriver::new(
        DriverSettings::from_config(&cfg),
        key_provider,
        broker,
        cancel,
    );
    if cfg.object_store.enabled {
        driver = driver.with_object_store(Arc::new(source::S3ObjectStore::new(aws.s3.clone())));
    }
    if cfg.table.enabled {
        driver = driver.with_table_engine(Arc::new(source::AthenaTableEngine::new(
            aws.athena.clone(),
            &cfg.table,
        )));
    }

    // -----------------------------------------------------------------------
    // 6. Report
    // -----------------------------------------------------------------------
    let result = driver.run().await;
    let summary = result.as_ref().cloned().unwrap_or_else(|_| Summary::default());
    println!(
        "{}",
        serde_json::to_string(&summary).context("failed to serialise run summary")?
    );
    telemetry.shutdown();

    match result {
        Err(e) if e.is_fatal() => Err(anyhow::Error::new(e).context("run aborted at startup")),
        Err(e) => {
            warn!(error = %e, "run ended early");
            Ok(())
        }
        Ok(_) => Ok(()),
    }
}

/// Cancel the run on the first Ctrl-C. The driver stops before the next
/// record and still flushes the broker.
async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("interrupt received; cancelling run");
            cancel.cancel();
        }
        Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
    }
}
