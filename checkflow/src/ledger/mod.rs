//! The append-only attempt ledger.
//!
//! Every execution attempt of every step produces exactly one
//! [`AttemptRecord`]. Rows are keyed by `(run_id, step_index, attempt)`,
//! never mutated and never deleted; the full history of a run is the sole
//! source of truth for resume.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryLedger;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedger;

use crate::context::ContextSnapshot;
use crate::core::{AttemptStatus, RunId, StepName};
use crate::errors::LedgerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-attempt measurements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLogs {
    /// Wall time of the attempt (or of the whole retry loop for `ok` rows).
    pub duration_ms: u64,
}

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// The run.
    pub run_id: RunId,
    /// Monotonic position of this step visit within the run.
    pub step_index: u64,
    /// The step.
    pub step_name: StepName,
    /// Outcome of the attempt.
    pub status: AttemptStatus,
    /// 1-based attempt number, contiguous per `step_index`.
    pub attempt: u32,
    /// Error message. Present iff `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Measurements.
    #[serde(default)]
    pub logs: AttemptLogs,
    /// Resumable projection of the context at this attempt.
    pub snapshot: ContextSnapshot,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

impl AttemptRecord {
    /// Creates a successful attempt row.
    #[must_use]
    pub fn ok(
        step_index: u64,
        step_name: StepName,
        attempt: u32,
        snapshot: ContextSnapshot,
        logs: AttemptLogs,
    ) -> Self {
        Self {
            run_id: snapshot.run_id.clone(),
            step_index,
            step_name,
            status: AttemptStatus::Ok,
            attempt,
            error: None,
            logs,
            snapshot,
            created_at: Utc::now(),
        }
    }

    /// Creates a failed attempt row.
    #[must_use]
    pub fn error(
        step_index: u64,
        step_name: StepName,
        attempt: u32,
        snapshot: ContextSnapshot,
        logs: AttemptLogs,
        error: impl Into<String>,
    ) -> Self {
        Self {
            run_id: snapshot.run_id.clone(),
            step_index,
            step_name,
            status: AttemptStatus::Error,
            attempt,
            error: Some(error.into()),
            logs,
            snapshot,
            created_at: Utc::now(),
        }
    }

    /// The ordering key of this row within its run.
    #[must_use]
    pub fn mark(&self) -> (u64, u32) {
        (self.step_index, self.attempt)
    }

    /// Returns true for an `ok` row of the terminal step.
    #[must_use]
    pub fn is_terminal_ok(&self) -> bool {
        self.status.is_ok() && self.step_name.is_terminal()
    }
}

/// The caller-visible projection of a ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Step index.
    pub step_index: u64,
    /// Step name.
    pub step_name: StepName,
    /// Attempt outcome.
    pub status: AttemptStatus,
    /// Attempt number.
    pub attempt: u32,
    /// Measured duration.
    pub duration_ms: u64,
    /// Error message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&AttemptRecord> for HistoryEntry {
    fn from(record: &AttemptRecord) -> Self {
        Self {
            step_index: record.step_index,
            step_name: record.step_name,
            status: record.status,
            attempt: record.attempt,
            duration_ms: record.logs.duration_ms,
            error: record.error.clone(),
        }
    }
}

/// Storage contract for attempt rows.
///
/// Implementations must make `record` durable before returning and must
/// tolerate concurrent writers for different runs. Errors are fatal to the
/// calling run and are never retried by the ledger itself.
#[async_trait]
pub trait AttemptLedger: Send + Sync {
    /// Appends a row. Fails with `DuplicateAttempt` if the key exists.
    async fn record(&self, record: AttemptRecord) -> Result<(), LedgerError>;

    /// Returns the highest `(step_index, attempt)` row for the run.
    async fn latest(&self, run_id: &RunId) -> Result<Option<AttemptRecord>, LedgerError>;

    /// Returns every row for the run ordered by `(step_index, attempt)`.
    async fn history(&self, run_id: &RunId) -> Result<Vec<AttemptRecord>, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipelineContext;

    #[test]
    fn test_history_entry_projection() {
        let snapshot = PipelineContext::new(RunId::new("r1")).snapshot();
        let record = AttemptRecord::error(
            3,
            StepName::Planning,
            2,
            snapshot,
            AttemptLogs { duration_ms: 7 },
            "boom",
        );

        let entry = HistoryEntry::from(&record);
        assert_eq!(entry.step_index, 3);
        assert_eq!(entry.step_name, StepName::Planning);
        assert_eq!(entry.status, AttemptStatus::Error);
        assert_eq!(entry.attempt, 2);
        assert_eq!(entry.duration_ms, 7);
        assert_eq!(entry.error.as_deref(), Some("boom"));
        assert_eq!(record.mark(), (3, 2));
    }

    #[test]
    fn test_terminal_ok() {
        let snapshot = PipelineContext::new(RunId::new("r1")).snapshot();
        let ok = AttemptRecord::ok(6, StepName::Release, 1, snapshot.clone(), AttemptLogs::default());
        let err = AttemptRecord::error(6, StepName::Release, 1, snapshot, AttemptLogs::default(), "x");
        assert!(ok.is_terminal_ok());
        assert!(!err.is_terminal_ok());
    }
}
