//! Resume coordinator.
//!
//! Rebuilds a resumable context purely from a run's ledger history.

use crate::context::PipelineContext;
use crate::core::{RunId, StepName, STEP_ORDER};
use crate::errors::LedgerError;
use crate::ledger::{AttemptLedger, AttemptRecord};
use std::sync::Arc;

/// Reconstructs contexts from the attempt ledger.
#[derive(Clone)]
pub struct ResumeCoordinator {
    ledger: Arc<dyn AttemptLedger>,
}

impl std::fmt::Debug for ResumeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeCoordinator").finish_non_exhaustive()
    }
}

impl ResumeCoordinator {
    /// Creates a coordinator reading from `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<dyn AttemptLedger>) -> Self {
        Self { ledger }
    }

    /// Returns the reconstructed context and the position in the fixed
    /// order the run continues at.
    ///
    /// A run without rows yields a fresh context at position 0. A position
    /// equal to the number of steps means the run has no work left.
    pub async fn resume_from(&self, run_id: &RunId) -> Result<(PipelineContext, usize), LedgerError> {
        let rows = self.ledger.history(run_id).await?;
        Ok(rebuild(run_id, &rows))
    }
}

/// Position of the next unexecuted step given the ok rows so far.
///
/// Forward progress moves the cursor past the step. A failed qa verdict
/// sends it back to `engineer`, so backtrack trips never count as forward
/// progress until a passing qa is seen.
fn resume_cursor(rows: &[AttemptRecord]) -> usize {
    let mut cursor = 0;
    for row in rows.iter().filter(|r| r.status.is_ok()) {
        let position = row.step_name.position();
        if position < cursor {
            continue;
        }
        let failed_qa = row.step_name == StepName::Qa
            && !row
                .snapshot
                .artifacts
                .tests_result
                .is_some_and(|verdict| verdict.passed);
        cursor = if failed_qa {
            StepName::Engineer.position()
        } else {
            position + 1
        };
    }
    cursor.min(STEP_ORDER.len())
}

fn rebuild(run_id: &RunId, rows: &[AttemptRecord]) -> (PipelineContext, usize) {
    let Some(latest) = rows.last() else {
        return (PipelineContext::new(run_id.clone()), 0);
    };

    let mut ctx = PipelineContext::from_snapshot(&latest.snapshot);
    let cursor = if latest.status.is_ok() {
        ctx.next_step_index = latest.step_index + 1;
        resume_cursor(rows)
    } else {
        // Continue the exhausted step under its own index. It may have no ok
        // row before it (a run started late), so it fixes the cursor itself.
        ctx.next_step_index = latest.step_index;
        ctx.current_step_index = Some(latest.step_index);
        ctx.current_step_name = Some(latest.step_name);
        ctx.current_attempts = latest.attempt;
        latest.step_name.position()
    };
    ctx.resume_pointer = cursor;

    tracing::debug!(
        run_id = %run_id,
        rows = rows.len(),
        cursor,
        next_step_index = ctx.next_step_index,
        "Rebuilt context from ledger"
    );
    (ctx, cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{QaVerdict, RunControls};
    use crate::ledger::{AttemptLogs, InMemoryLedger};
    use pretty_assertions::assert_eq;

    /// Builds ok rows for `steps` in order, threading a context through
    /// like the runner would.
    fn ok_rows(run: &str, steps: &[(StepName, Option<bool>)]) -> Vec<AttemptRecord> {
        let mut ctx = PipelineContext::new(RunId::new(run));
        let mut rows = Vec::new();
        for (index, (step, verdict)) in steps.iter().enumerate() {
            ctx.history.push(*step);
            ctx.add_note(*step, format!("{step} done"));
            if let Some(passed) = verdict {
                ctx.qa_attempts += 1;
                ctx.artifacts.tests_result = Some(QaVerdict {
                    passed: *passed,
                    attempts: ctx.qa_attempts,
                });
            }
            rows.push(AttemptRecord::ok(
                index as u64,
                *step,
                1,
                ctx.snapshot(),
                AttemptLogs::default(),
            ));
        }
        rows
    }

    #[test]
    fn test_no_rows_yields_fresh_context() {
        let (ctx, cursor) = rebuild(&RunId::new("r1"), &[]);
        assert_eq!(cursor, 0);
        assert_eq!(ctx, PipelineContext::new(RunId::new("r1")));
    }

    #[test]
    fn test_paused_after_research() {
        use StepName::*;
        let rows = ok_rows("r1", &[(Product, None), (Design, None), (Research, None)]);
        let (ctx, cursor) = rebuild(&RunId::new("r1"), &rows);

        assert_eq!(cursor, Planning.position());
        assert_eq!(ctx.resume_pointer, 3);
        assert_eq!(ctx.next_step_index, 3);
        assert_eq!(ctx.history, vec![Product, Design, Research]);
        assert_eq!(ctx.shared_notes.len(), 3);
    }

    #[test]
    fn test_failed_qa_returns_cursor_to_engineer() {
        use StepName::*;
        let rows = ok_rows(
            "r1",
            &[
                (Product, None),
                (Design, None),
                (Research, None),
                (Planning, None),
                (Engineer, None),
                (Qa, Some(false)),
            ],
        );
        let (ctx, cursor) = rebuild(&RunId::new("r1"), &rows);
        assert_eq!(cursor, Engineer.position());
        assert_eq!(ctx.qa_attempts, 1);
        assert_eq!(ctx.next_step_index, 6);
    }

    #[test]
    fn test_loop_engineer_moves_cursor_to_qa() {
        use StepName::*;
        let rows = ok_rows(
            "r1",
            &[
                (Product, None),
                (Design, None),
                (Research, None),
                (Planning, None),
                (Engineer, None),
                (Qa, Some(false)),
                (Engineer, None),
            ],
        );
        assert_eq!(resume_cursor(&rows), Qa.position());
    }

    #[test]
    fn test_finished_run_cursor_is_past_end() {
        use StepName::*;
        let rows = ok_rows(
            "r1",
            &[
                (Product, None),
                (Design, None),
                (Research, None),
                (Planning, None),
                (Engineer, None),
                (Qa, Some(true)),
                (Release, None),
            ],
        );
        assert_eq!(resume_cursor(&rows), STEP_ORDER.len());
    }

    #[test]
    fn test_error_tail_continues_same_index() {
        use StepName::*;
        let mut rows = ok_rows("r1", &[(Product, None)]);
        let snapshot = rows[0].snapshot.clone();
        for attempt in 1..=3 {
            rows.push(AttemptRecord::error(
                1,
                Design,
                attempt,
                snapshot.clone(),
                AttemptLogs::default(),
                "Injected failure at design",
            ));
        }

        let (ctx, cursor) = rebuild(&RunId::new("r1"), &rows);
        assert_eq!(cursor, Design.position());
        assert_eq!(ctx.next_step_index, 1);
        assert_eq!(ctx.current_step_index, Some(1));
        assert_eq!(ctx.current_step_name, Some(Design));
        assert_eq!(ctx.current_attempts, 3);
        assert_eq!(ctx.history, vec![Product]);
    }

    #[test]
    fn test_error_tail_without_ok_rows_points_at_failed_step() {
        use StepName::*;
        let ctx = PipelineContext::new(RunId::new("r1")).starting_at(Research);
        let rows: Vec<_> = (1..=3)
            .map(|attempt| {
                AttemptRecord::error(
                    2,
                    Research,
                    attempt,
                    ctx.snapshot(),
                    AttemptLogs::default(),
                    "Injected failure at research",
                )
            })
            .collect();

        let (rebuilt, cursor) = rebuild(&RunId::new("r1"), &rows);
        assert_eq!(cursor, Research.position());
        assert_eq!(rebuilt.resume_pointer, 2);
        assert_eq!(rebuilt.next_step_index, 2);
        assert_eq!(rebuilt.current_step_name, Some(Research));
        assert_eq!(rebuilt.current_attempts, 3);
    }

    #[test]
    fn test_error_tail_inside_loop_points_at_failed_step() {
        use StepName::*;
        let mut rows = ok_rows(
            "r1",
            &[
                (Product, None),
                (Design, None),
                (Research, None),
                (Planning, None),
                (Engineer, None),
                (Qa, Some(false)),
                (Engineer, None),
            ],
        );
        let snapshot = rows[6].snapshot.clone();
        rows.push(AttemptRecord::error(
            7,
            Qa,
            1,
            snapshot,
            AttemptLogs::default(),
            "flaky",
        ));

        let (ctx, cursor) = rebuild(&RunId::new("r1"), &rows);
        assert_eq!(cursor, Qa.position());
        assert_eq!(ctx.next_step_index, 7);
        assert_eq!(ctx.qa_attempts, 1);
    }

    #[tokio::test]
    async fn test_coordinator_reads_ledger_and_controls() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut ctx = PipelineContext::new(RunId::new("r1")).with_controls(RunControls {
            force_qa_fail: true,
            max_qa_loops: 3,
        });
        ctx.history.push(StepName::Product);
        ledger
            .record(AttemptRecord::ok(
                0,
                StepName::Product,
                1,
                ctx.snapshot(),
                AttemptLogs::default(),
            ))
            .await
            .unwrap();

        let coordinator = ResumeCoordinator::new(ledger);
        let (rebuilt, cursor) = coordinator.resume_from(&RunId::new("r1")).await.unwrap();
        assert_eq!(cursor, 1);
        assert!(rebuilt.controls.force_qa_fail);
        assert_eq!(rebuilt.controls.max_qa_loops, 3);
        assert!(rebuilt.is_resumed());
        assert!(!rebuilt.resume_consumed);
    }
}
