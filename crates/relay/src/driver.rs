//! Pipeline driver: one run over both upstream sources.
//!
//! # Run sequence
//!
//! 1. Fetch the session key once and build the [`Cipher`]. Failure here
//!    aborts the run before any unit is touched.
//! 2. List S3 batch files oldest-first and process each as one unit.
//! 3. Query the configured table partition and process the rows as one unit.
//! 4. Flush and close the broker.
//!
//! Units are processed strictly one after another. A unit that cannot be
//! read or decoded is recorded for replay and the run moves on; a source
//! that cannot be reached is skipped and the other source still runs.
//! Cancellation is honoured between units and, inside a unit, between records.

use std::sync::Arc;

use common::{PipelineError, Summary};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::{BatchSettings, OrderedBatchProcessor};
use crate::broker::Broker;
use crate::config::Config;
use crate::crypto::Cipher;
use crate::key::KeyProvider;
use crate::publisher::{Publisher, RetryPolicy};
use crate::source::object_store::group_hint_from_key;
use crate::source::{
    ObjectStore, PartitionPredicate, SourceUnit, TableEngine, TableRef, UnitBody, UnitOrigin,
};
use crate::telemetry::PipelineMetrics;

/// Where to find S3 batch files.
#[derive(Debug, Clone)]
pub struct ObjectStoreSource {
    pub bucket: String,
    pub prefix: String,
}

/// Which table partition to query.
#[derive(Debug, Clone)]
pub struct TableSource {
    pub table: TableRef,
    pub predicate: PartitionPredicate,
}

/// Everything the driver takes from configuration.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// `None` when the object-store source is disabled.
    pub object_store: Option<ObjectStoreSource>,
    /// `None` when the table source is disabled.
    pub table: Option<TableSource>,
    pub retry: RetryPolicy,
    pub batch: BatchSettings,
}

impl DriverSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let object_store = cfg.object_store.enabled.then(|| ObjectStoreSource {
            bucket: cfg.object_store.bucket.clone(),
            prefix: cfg.object_store.prefix.clone(),
        });
        let table = cfg.table.enabled.then(|| TableSource {
            table: TableRef {
                database: cfg.table.database.clone(),
                table: cfg.table.table.clone(),
            },
            predicate: PartitionPredicate {
                column: cfg.table.partition_column.clone(),
                date: cfg.table.resolved_date(),
            },
        });
        Self {
            object_store,
            table,
            retry: RetryPolicy::from_config(&cfg.publish),
            batch: BatchSettings::from_config(cfg),
        }
    }
}

/// Runs the pipeline once over the configured sources.
pub struct PipelineDriver {
    settings: DriverSettings,
    key_provider: Arc<dyn KeyProvider>,
    broker: Arc<dyn Broker>,
    object_store: Option<Arc<dyn ObjectStore>>,
    table_engine: Option<Arc<dyn TableEngine>>,
    metrics: PipelineMetrics,
    cancel: CancellationToken,
}

impl PipelineDriver {
    pub fn new(
        settings: DriverSettings,
        key_provider: Arc<dyn KeyProvider>,
        broker: Arc<dyn Broker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            key_provider,
            broker,
            object_store: None,
            table_engine: None,
            metrics: PipelineMetrics::new(),
            cancel,
        }
    }

    /// Attach the object store. Ignored if the source is disabled in settings.
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Attach the table engine. Ignored if the source is disabled in settings.
    pub fn with_table_engine(mut self, engine: Arc<dyn TableEngine>) -> Self {
        self.table_engine = Some(engine);
        self
    }

    /// Execute one run.
    ///
    /// # Errors
    ///
    /// Only the startup key failures escape: [`PipelineError::KeyUnavailable`]
    /// and [`PipelineError::InvalidKey`]. Everything else is folded into the
    /// returned [`Summary`].
    pub async fn run(&self) -> Result<Summary, PipelineError> {
        let run_id = Uuid::new_v4();
        self.run_inner()
            .instrument(info_span!("pipeline_run", %run_id))
            .await
    }

    async fn run_inner(&self) -> Result<Summary, PipelineError> {
        let key = self.key_provider.fetch_key().await.map_err(|e| {
            error!(error = %e, "session key unavailable; aborting run");
            PipelineError::KeyUnavailable(e.to_string())
        })?;
        let cipher = Cipher::new(&key).map_err(|e| {
            error!(error = %e, "session key rejected by cipher; aborting run");
            PipelineError::InvalidKey(e.to_string())
        })?;
        drop(key);
        info!("session key loaded");

        let processor = OrderedBatchProcessor::new(
            cipher,
            Publisher::new(Arc::clone(&self.broker), self.settings.retry),
            self.settings.batch.clone(),
            self.metrics.clone(),
        );
        let mut summary = Summary::default();

        if let (Some(source), Some(store)) = (&self.settings.object_store, &self.object_store) {
            self.run_object_store(store.as_ref(), source, &processor, &mut summary)
                .await;
        }
        if let (Some(source), Some(engine)) = (&self.settings.table, &self.table_engine) {
            if !self.cancel.is_cancelled() {
                self.run_table(engine.as_ref(), source, &processor, &mut summary)
                    .await;
            }
        }

        summary.cancelled = self.cancel.is_cancelled();
        if let Err(e) = processor.shutdown().await {
            warn!(error = %e, "broker did not shut down cleanly");
        }

        info!(
            records = summary.total_records(),
            delivered = summary.delivered,
            failed = summary.failed,
            skipped = summary.skipped,
            units_processed = summary.units_processed,
            units_failed = summary.units_failed,
            cancelled = summary.cancelled,
            "run complete"
        );
        Ok(summary)
    }

    async fn run_object_store(
        &self,
        store: &dyn ObjectStore,
        source: &ObjectStoreSource,
        processor: &OrderedBatchProcessor,
        summary: &mut Summary,
    ) {
        let origin = UnitOrigin::ObjectStore;
        let listings = match store.list_units(&source.bucket, &source.prefix).await {
            Ok(l) => l,
            Err(e) => {
                self.source_unavailable(origin, e.to_string());
                return;
            }
        };
        info!(bucket = %source.bucket, prefix = %source.prefix, units = listings.len(), "batch files listed");

        for listing in listings {
            if self.cancel.is_cancelled() {
                info!("run cancelled; stopping before next unit");
                return;
            }
            let unit_id = listing.unit_id;
            let body = match store.read_unit(&source.bucket, &unit_id).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    warn!(unit_id = %unit_id, "unit disappeared before it could be read");
                    self.unit_failed(origin, &unit_id, summary);
                    continue;
                }
                Err(e) => {
                    warn!(unit_id = %unit_id, error = %e, "unit could not be read");
                    self.unit_failed(origin, &unit_id, summary);
                    continue;
                }
            };
            let unit = SourceUnit {
                group_hint: group_hint_from_key(&unit_id, &source.prefix),
                id: unit_id,
                origin,
                body: UnitBody::Encoded(body),
            };
            self.process_unit(processor, unit, summary).await;
        }
    }

    async fn run_table(
        &self,
        engine: &dyn TableEngine,
        source: &TableSource,
        processor: &OrderedBatchProcessor,
        summary: &mut Summary,
    ) {
        let queried = tokio::select! {
            res = engine.query(&source.table, &source.predicate) => res,
            _ = self.cancel.cancelled() => {
                info!("run cancelled; abandoning table query");
                return;
            }
        };
        let rows = match queried {
            Ok(rows) => rows,
            Err(e) => {
                self.source_unavailable(UnitOrigin::Table, e.to_string());
                return;
            }
        };
        let unit = SourceUnit {
            id: source.table.unit_id(&source.predicate),
            origin: UnitOrigin::Table,
            group_hint: None,
            body: UnitBody::Rows(rows),
        };
        self.process_unit(processor, unit, summary).await;
    }

    async fn process_unit(
        &self,
        processor: &OrderedBatchProcessor,
        unit: SourceUnit,
        summary: &mut Summary,
    ) {
        let unit_id = unit.id.clone();
        let origin = unit.origin;
        match processor.process(unit, &self.cancel).await {
            Ok(outcomes) => {
                summary.record_unit(&unit_id, &outcomes);
                self.metrics.record_unit(origin.as_str(), "processed");
                info!(unit_id = %unit_id, origin = origin.as_str(), records = outcomes.len(), "unit processed");
            }
            Err(e) => {
                error!(unit_id = %unit_id, origin = origin.as_str(), error = %e, "unit failed");
                self.unit_failed(origin, &unit_id, summary);
            }
        }
    }

    fn unit_failed(&self, origin: UnitOrigin, unit_id: &str, summary: &mut Summary) {
        summary.record_failed_unit(unit_id);
        self.metrics.record_unit(origin.as_str(), "failed");
    }

    fn source_unavailable(&self, origin: UnitOrigin, reason: String) {
        let err = PipelineError::UpstreamUnavailable {
            source_name: origin.as_str().to_owned(),
            reason,
        };
        error!(error = %err, "source skipped");
        self.metrics.record_unit(origin.as_str(), "unavailable");
    }
}
