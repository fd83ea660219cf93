//! Shared outcome types and the error taxonomy used across `relay` crates.

pub mod error;
pub mod outcome;

pub use error::PipelineError;
pub use outcome::{PublishOutcome, PublishStatus, RecordOutcome, Summary};
