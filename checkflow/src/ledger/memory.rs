//! In-memory attempt ledger.

use super::{AttemptLedger, AttemptRecord};
use crate::core::RunId;
use crate::errors::LedgerError;
use async_trait::async_trait;
use dashmap::DashMap;

/// Ledger backed by a concurrent map of per-run row vectors.
///
/// Rows are kept sorted by `(step_index, attempt)` on insert, so reads
/// never sort. Different runs live in different shards and never contend.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    runs: DashMap<RunId, Vec<AttemptRecord>>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of runs with at least one row.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Returns the total number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.iter().map(|rows| rows.len()).sum()
    }

    /// Returns true if no rows were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[async_trait]
impl AttemptLedger for InMemoryLedger {
    async fn record(&self, record: AttemptRecord) -> Result<(), LedgerError> {
        let mut rows = self.runs.entry(record.run_id.clone()).or_default();
        let mark = record.mark();

        match rows.binary_search_by_key(&mark, AttemptRecord::mark) {
            Ok(_) => Err(LedgerError::DuplicateAttempt {
                run_id: record.run_id,
                step_index: record.step_index,
                attempt: record.attempt,
            }),
            Err(pos) => {
                rows.insert(pos, record);
                Ok(())
            }
        }
    }

    async fn latest(&self, run_id: &RunId) -> Result<Option<AttemptRecord>, LedgerError> {
        Ok(self
            .runs
            .get(run_id)
            .and_then(|rows| rows.last().cloned()))
    }

    async fn history(&self, run_id: &RunId) -> Result<Vec<AttemptRecord>, LedgerError> {
        Ok(self
            .runs
            .get(run_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipelineContext;
    use crate::core::StepName;
    use crate::ledger::AttemptLogs;
    use std::sync::Arc;

    fn row(run: &str, step_index: u64, step: StepName, attempt: u32) -> AttemptRecord {
        let snapshot = PipelineContext::new(RunId::new(run)).snapshot();
        AttemptRecord::ok(step_index, step, attempt, snapshot, AttemptLogs::default())
    }

    #[tokio::test]
    async fn test_history_is_ordered() {
        let ledger = InMemoryLedger::new();
        ledger.record(row("r1", 1, StepName::Design, 2)).await.unwrap();
        ledger.record(row("r1", 0, StepName::Product, 1)).await.unwrap();
        ledger.record(row("r1", 1, StepName::Design, 1)).await.unwrap();

        let marks: Vec<_> = ledger
            .history(&RunId::new("r1"))
            .await
            .unwrap()
            .iter()
            .map(AttemptRecord::mark)
            .collect();
        assert_eq!(marks, vec![(0, 1), (1, 1), (1, 2)]);
    }

    #[tokio::test]
    async fn test_latest_is_highest_mark() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.latest(&RunId::new("r1")).await.unwrap().is_none());

        ledger.record(row("r1", 0, StepName::Product, 1)).await.unwrap();
        ledger.record(row("r1", 1, StepName::Design, 1)).await.unwrap();

        let latest = ledger.latest(&RunId::new("r1")).await.unwrap().unwrap();
        assert_eq!(latest.step_name, StepName::Design);
    }

    #[tokio::test]
    async fn test_duplicate_attempt_rejected() {
        let ledger = InMemoryLedger::new();
        ledger.record(row("r1", 0, StepName::Product, 1)).await.unwrap();
        let err = ledger
            .record(row("r1", 0, StepName::Product, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateAttempt { step_index: 0, attempt: 1, .. }));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let ledger = InMemoryLedger::new();
        ledger.record(row("r1", 0, StepName::Product, 1)).await.unwrap();
        ledger.record(row("r2", 0, StepName::Product, 1)).await.unwrap();

        assert_eq!(ledger.run_count(), 2);
        assert_eq!(ledger.history(&RunId::new("r1")).await.unwrap().len(), 1);
        assert!(ledger.history(&RunId::new("r3")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_distinct_runs() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut handles = Vec::new();
        for run in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let run_id = format!("run-{run}");
                for idx in 0..10 {
                    ledger
                        .record(row(&run_id, idx, StepName::Product, 1))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(ledger.len(), 80);
    }
}
