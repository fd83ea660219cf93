//! Pipeline error taxonomy shared across crates.

use thiserror::Error;

/// Top-level pipeline error type.
///
/// Every variant is caught at the boundary of the unit it occurred in and
/// turned into a recorded outcome, except the startup-time key failures:
/// - [`PipelineError::KeyUnavailable`] and [`PipelineError::InvalidKey`] → abort the run
/// - [`PipelineError::EncryptionFailed`] → one record `Failed`
/// - [`PipelineError::TransientPublish`] → retried, then one record `Failed`
/// - [`PipelineError::PermanentPublish`] → one record `Failed`, no retry
/// - [`PipelineError::UnitDecode`] → one source unit dropped, siblings continue
/// - [`PipelineError::UpstreamUnavailable`] → one source skipped, the other still runs
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The session key could not be retrieved from the secret store.
    #[error("encryption key unavailable: {0}")]
    KeyUnavailable(String),

    /// The retrieved key is not usable by the cipher.
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    /// Encrypting a single record failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// The broker rejected a send with a failure that may clear on retry.
    #[error("transient publish error: {0}")]
    TransientPublish(String),

    /// The broker rejected a send with a failure that cannot clear on retry.
    #[error("permanent publish error: {0}")]
    PermanentPublish(String),

    /// A source unit could not be decoded into records.
    #[error("unit {unit_id} could not be decoded: {reason}")]
    UnitDecode {
        /// Identifier of the unit that failed.
        unit_id: String,
        /// Decoder message.
        reason: String,
    },

    /// The object store or table engine could not be reached.
    #[error("upstream {source_name} unavailable: {reason}")]
    UpstreamUnavailable {
        /// Which collaborator failed (`"object_store"` or `"table"`).
        source_name: String,
        /// Underlying failure message.
        reason: String,
    },
}

impl PipelineError {
    /// Returns `true` when the error must abort the whole run rather than
    /// being recorded against a unit or record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::KeyUnavailable(_) | PipelineError::InvalidKey(_)
        )
    }

    /// Returns `true` for failures a retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientPublish(_))
    }
}
