//! Per-record publish outcomes and the run summary built from them.
//!
//! These types are serialised as JSON when the run summary is emitted, so
//! they must never carry record content or key material.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Publish outcome
// ---------------------------------------------------------------------------

/// Terminal state of one record's encrypt + publish cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    /// The broker acknowledged the record.
    Delivered,
    /// Encryption failed, the broker rejected the record, or retries ran out.
    Failed,
    /// The record was never attempted (unplaceable or cancelled).
    Skipped,
}

/// Result of publishing a single record, with the attempts it consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    /// Terminal status.
    pub status: PublishStatus,
    /// Number of broker send attempts made (0 when nothing was sent).
    pub attempts: u32,
    /// Reason for a `Failed` or `Skipped` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PublishOutcome {
    /// A record acknowledged by the broker after `attempts` sends.
    pub fn delivered(attempts: u32) -> Self {
        Self {
            status: PublishStatus::Delivered,
            attempts,
            reason: None,
        }
    }

    /// A record that could not be delivered.
    pub fn failed(attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            status: PublishStatus::Failed,
            attempts,
            reason: Some(reason.into()),
        }
    }

    /// A record that was never sent.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: PublishStatus::Skipped,
            attempts: 0,
            reason: Some(reason.into()),
        }
    }

    /// Returns `true` if the broker acknowledged the record.
    pub fn is_delivered(&self) -> bool {
        self.status == PublishStatus::Delivered
    }
}

/// A [`PublishOutcome`] tied back to where its record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// Source unit the record was decoded from.
    pub unit_id: String,
    /// Position of the record in decode order within its unit.
    pub position: usize,
    /// Group key the record was published under, if one was resolved.
    pub group_key: Option<String>,
    /// What happened to the record.
    pub outcome: PublishOutcome,
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Records acknowledged by the broker.
    pub delivered: u64,
    /// Records that could not be delivered.
    pub failed: u64,
    /// Records that were never attempted.
    pub skipped: u64,
    /// Units whose records were all given an outcome.
    pub units_processed: u64,
    /// Units that could not be read or decoded.
    pub units_failed: u64,
    /// Units worth replaying: unreadable, undecodable, or holding a `Failed` record.
    pub failed_units: Vec<String>,
    /// Whether the run stopped early on cancellation.
    pub cancelled: bool,
}

impl Summary {
    /// Fold one unit's record outcomes into the summary.
    pub fn record_unit(&mut self, unit_id: &str, outcomes: &[RecordOutcome]) {
        let mut any_failed = false;
        for o in outcomes {
            match o.outcome.status {
                PublishStatus::Delivered => self.delivered += 1,
                PublishStatus::Failed => {
                    self.failed += 1;
                    any_failed = true;
                }
                PublishStatus::Skipped => self.skipped += 1,
            }
        }
        self.units_processed += 1;
        if any_failed {
            self.mark_for_replay(unit_id);
        }
    }

    /// Record a unit that produced no outcomes because it could not be read
    /// or decoded.
    pub fn record_failed_unit(&mut self, unit_id: &str) {
        self.units_failed += 1;
        self.mark_for_replay(unit_id);
    }

    /// Total records that received an outcome.
    pub fn total_records(&self) -> u64 {
        self.delivered + self.failed + self.skipped
    }

    fn mark_for_replay(&mut self, unit_id: &str) {
        if !self.failed_units.iter().any(|u| u == unit_id) {
            self.failed_units.push(unit_id.to_owned());
        }
    }
}
