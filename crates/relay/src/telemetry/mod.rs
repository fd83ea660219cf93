//! OpenTelemetry setup: structured logs, optional OTLP traces and metrics.
//!
//! # Telemetry invariants
//!
//! - **No record content or key material** may appear in any span attribute,
//!   metric label, or log field. Group keys are logged (they are needed to
//!   replay failures) but never used as metric labels.
//! - Log level is configurable via `log_level` (default: `info`) and
//!   overridden by `RUST_LOG`.

pub mod init;
pub mod metrics;

pub use init::init_telemetry;
pub use metrics::PipelineMetrics;
