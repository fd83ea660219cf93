//! Pipeline counters.
//!
//! Instruments come from the global meter provider, so they are no-ops until
//! [`init_telemetry`](super::init_telemetry) installs an OTLP exporter.

use common::PublishStatus;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};

/// Counters shared by the driver, batch processor, and publisher.
#[derive(Clone)]
pub struct PipelineMetrics {
    records: Counter<u64>,
    attempts: Histogram<u64>,
    units: Counter<u64>,
}

impl PipelineMetrics {
    /// Create the instruments on the `relay` meter.
    pub fn new() -> Self {
        let meter = global::meter("relay");
        Self {
            records: meter
                .u64_counter("relay.records")
                .with_description("Records by terminal outcome")
                .init(),
            attempts: meter
                .u64_histogram("relay.publish.attempts")
                .with_description("Broker send attempts per published record")
                .init(),
            units: meter
                .u64_counter("relay.units")
                .with_description("Source units by origin and result")
                .init(),
        }
    }

    /// Count one record's outcome and the attempts it consumed.
    pub fn record_outcome(&self, status: PublishStatus, attempts: u32) {
        let label = match status {
            PublishStatus::Delivered => "delivered",
            PublishStatus::Failed => "failed",
            PublishStatus::Skipped => "skipped",
        };
        self.records.add(1, &[KeyValue::new("outcome", label)]);
        if attempts > 0 {
            self.attempts.record(u64::from(attempts), &[]);
        }
    }

    /// Count one source unit. `origin` is `"object_store"` or `"table"`.
    pub fn record_unit(&self, origin: &'static str, result: &'static str) {
        self.units.add(
            1,
            &[KeyValue::new("origin", origin), KeyValue::new("result", result)],
        );
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
