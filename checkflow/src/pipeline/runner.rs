//! The step runner.
//!
//! Wraps one step invocation with resume skipping, fault injection, retries
//! and one ledger row per attempt. Drivers own the context and call
//! [`StepRunner::run_step`] once per step visit.

use super::retry::{execute, Outcome, RetryError, RetryPolicy, RetryableOperation};
use crate::context::PipelineContext;
use crate::core::StepName;
use crate::errors::{EngineError, LedgerError, StepFailure};
use crate::events::{self, EventSink};
use crate::ledger::{AttemptLedger, AttemptLogs, AttemptRecord};
use crate::steps::Step;
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What happened to a step visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRun {
    /// The step executed and its ok row was recorded.
    Completed,
    /// The step ran before the resume point and was passed over.
    Skipped,
    /// The run had already been halted; nothing happened.
    Halted,
}

/// Runs single steps against the ledger.
#[derive(Clone)]
pub struct StepRunner {
    ledger: Arc<dyn AttemptLedger>,
    policy: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRunner")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl StepRunner {
    /// Creates a runner writing to `ledger`.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn AttemptLedger>,
        policy: RetryPolicy,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            ledger,
            policy,
            events,
        }
    }

    /// The retry policy applied to every step.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The sink lifecycle events go to.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Runs `step` once, retrying per the policy.
    ///
    /// On success `ctx` is replaced by the step's output, the step is in
    /// `history`, and `next_step_index` has advanced. On failure `ctx`
    /// keeps the state from before the step, with the mid-retry markers
    /// pointing at the failed step.
    pub async fn run_step<D: Send + Sync>(
        &self,
        step: StepName,
        implementation: &dyn Step<D>,
        ctx: &mut PipelineContext,
        deps: &D,
    ) -> Result<StepRun, EngineError> {
        if ctx.early_stop {
            return Ok(StepRun::Halted);
        }

        if !ctx.resume_consumed && step.position() < ctx.resume_pointer {
            tracing::debug!(run_id = %ctx.run_id, step = %step, "Skipping step before resume point");
            self.events
                .emit(
                    events::STEP_SKIPPED,
                    Some(json!({ "run_id": ctx.run_id, "step": step })),
                )
                .await;
            return Ok(StepRun::Skipped);
        }
        ctx.resume_consumed = true;

        let (step_index, prior_attempts) = ctx.claim_step_index(step);
        let run_id = ctx.run_id.clone();
        let started = Instant::now();

        let mut operation = StepAttempt {
            runner: self,
            step,
            implementation,
            ctx: &mut *ctx,
            deps,
            step_index,
            prior_attempts,
        };

        match execute(&self.policy, &mut operation).await {
            Ok((mut next, attempt)) => {
                let logs = AttemptLogs {
                    duration_ms: elapsed_ms(started.elapsed()),
                };
                next.complete_step(step, step_index);
                self.ledger
                    .record(AttemptRecord::ok(
                        step_index,
                        step,
                        attempt,
                        next.snapshot(),
                        logs,
                    ))
                    .await?;
                *ctx = next;

                tracing::info!(
                    run_id = %run_id,
                    step = %step,
                    step_index,
                    attempt,
                    duration_ms = logs.duration_ms,
                    "Step completed"
                );
                let mut payload = events::step_payload(&run_id, step, step_index);
                payload["attempt"] = json!(attempt);
                self.events.emit(events::STEP_COMPLETED, Some(payload)).await;
                Ok(StepRun::Completed)
            }
            Err(err) => {
                let retryable = matches!(err, RetryError::Exhausted { .. });
                let attempts = prior_attempts + err.attempts();
                match err.into_inner() {
                    AttemptError::Ledger(e) => Err(EngineError::Ledger(e)),
                    AttemptError::Step(failure) => {
                        tracing::error!(
                            run_id = %run_id,
                            step = %step,
                            step_index,
                            attempts,
                            retryable,
                            error = %failure,
                            "Step failed"
                        );
                        Err(EngineError::StepFailed {
                            run_id,
                            step,
                            attempts,
                            message: failure.message,
                            retryable,
                        })
                    }
                }
            }
        }
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptError {
    Step(StepFailure),
    Ledger(LedgerError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step(e) => write!(f, "{e}"),
            Self::Ledger(e) => write!(f, "{e}"),
        }
    }
}

/// One logical step invocation seen by the retry executor.
struct StepAttempt<'a, D> {
    runner: &'a StepRunner,
    step: StepName,
    implementation: &'a dyn Step<D>,
    ctx: &'a mut PipelineContext,
    deps: &'a D,
    step_index: u64,
    prior_attempts: u32,
}

impl<D> StepAttempt<'_, D> {
    /// Takes one pending injected failure for this step, if any.
    fn take_injected_failure(&mut self) -> Option<StepFailure> {
        let remaining = self.ctx.inject_failures.get_mut(&self.step)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(StepFailure::injected(self.step))
    }
}

#[async_trait]
impl<D: Send + Sync> RetryableOperation for StepAttempt<'_, D> {
    type Output = (PipelineContext, u32);
    type Error = AttemptError;

    async fn attempt(&mut self, attempt: u32) -> Outcome<Self::Output, Self::Error> {
        let attempt = self.prior_attempts + attempt;
        let started = Instant::now();

        let outcome = match self.take_injected_failure() {
            Some(failure) => Outcome::Retryable(failure),
            None => {
                let mut working = self.ctx.clone();
                working.history.push(self.step);
                self.implementation.run(working, self.deps).await
            }
        };

        let (failure, retryable) = match outcome {
            Outcome::Ok(mut next) => {
                if next.run_id != self.ctx.run_id {
                    tracing::warn!(
                        run_id = %self.ctx.run_id,
                        step = %self.step,
                        returned = %next.run_id,
                        "Step changed the run id; keeping the original"
                    );
                    next.run_id = self.ctx.run_id.clone();
                }
                return Outcome::Ok((next, attempt));
            }
            Outcome::Retryable(failure) => (failure, true),
            Outcome::Fatal(failure) => (failure, false),
        };

        let logs = AttemptLogs {
            duration_ms: elapsed_ms(started.elapsed()),
        };
        let row = AttemptRecord::error(
            self.step_index,
            self.step,
            attempt,
            self.ctx.snapshot(),
            logs,
            failure.message.clone(),
        );
        if let Err(e) = self.runner.ledger.record(row).await {
            return Outcome::Fatal(AttemptError::Ledger(e));
        }
        self.ctx.current_attempts = attempt;

        tracing::warn!(
            run_id = %self.ctx.run_id,
            step = %self.step,
            step_index = self.step_index,
            attempt,
            error = %failure,
            "Step attempt failed"
        );
        let mut payload = events::step_payload(&self.ctx.run_id, self.step, self.step_index);
        payload["attempt"] = json!(attempt);
        payload["error"] = json!(failure.message);
        self.runner
            .events
            .emit(events::STEP_ATTEMPT_FAILED, Some(payload))
            .await;

        if retryable {
            Outcome::Retryable(AttemptError::Step(failure))
        } else {
            Outcome::Fatal(AttemptError::Step(failure))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttemptStatus, RunId};
    use crate::events::CollectingEventSink;
    use crate::ledger::InMemoryLedger;
    use crate::steps::{FnStep, ProductStep};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner(ledger: Arc<InMemoryLedger>, events: Arc<CollectingEventSink>) -> StepRunner {
        StepRunner::new(ledger, RetryPolicy::immediate(3), events)
    }

    fn statuses(rows: &[AttemptRecord]) -> Vec<(u64, u32, AttemptStatus)> {
        rows.iter()
            .map(|r| (r.step_index, r.attempt, r.status))
            .collect()
    }

    #[tokio::test]
    async fn test_success_appends_history_and_records_ok_row() {
        let ledger = Arc::new(InMemoryLedger::new());
        let events = Arc::new(CollectingEventSink::new());
        let runner = runner(ledger.clone(), events.clone());
        let mut ctx = PipelineContext::new(RunId::new("r1"));

        let run = runner
            .run_step(StepName::Product, &ProductStep, &mut ctx, &())
            .await
            .unwrap();

        assert_eq!(run, StepRun::Completed);
        assert_eq!(ctx.history, vec![StepName::Product]);
        assert_eq!(ctx.next_step_index, 1);
        assert!(ctx.artifacts.prd.is_some());

        let rows = ledger.history(&RunId::new("r1")).await.unwrap();
        assert_eq!(statuses(&rows), vec![(0, 1, AttemptStatus::Ok)]);
        assert_eq!(rows[0].snapshot.history, vec![StepName::Product]);
        assert_eq!(events.event_types(), vec!["step.completed"]);
    }

    #[tokio::test]
    async fn test_injected_failures_are_recorded_then_succeed() {
        let ledger = Arc::new(InMemoryLedger::new());
        let events = Arc::new(CollectingEventSink::new());
        let runner = runner(ledger.clone(), events.clone());
        let mut inject = BTreeMap::new();
        inject.insert(StepName::Product, 2);
        let mut ctx = PipelineContext::new(RunId::new("r1")).with_inject_failures(inject);

        runner
            .run_step(StepName::Product, &ProductStep, &mut ctx, &())
            .await
            .unwrap();

        let rows = ledger.history(&RunId::new("r1")).await.unwrap();
        assert_eq!(
            statuses(&rows),
            vec![
                (0, 1, AttemptStatus::Error),
                (0, 2, AttemptStatus::Error),
                (0, 3, AttemptStatus::Ok),
            ]
        );
        assert_eq!(rows[0].error.as_deref(), Some("Injected failure at product"));
        // Failed attempts leave no trace in history.
        assert_eq!(ctx.history, vec![StepName::Product]);
        assert!(rows[1].snapshot.history.is_empty());
        assert_eq!(ctx.inject_failures[&StepName::Product], 0);
        assert_eq!(events.events_of_type("step.attempt_failed").len(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_step_and_attempts() {
        let ledger = Arc::new(InMemoryLedger::new());
        let runner = runner(ledger.clone(), Arc::new(CollectingEventSink::new()));
        let mut inject = BTreeMap::new();
        inject.insert(StepName::Design, 5);
        let mut ctx = PipelineContext::new(RunId::new("r1")).with_inject_failures(inject);
        ctx.next_step_index = 1;

        let err = runner
            .run_step(StepName::Design, &crate::steps::DesignStep, &mut ctx, &())
            .await
            .unwrap_err();

        assert_eq!(err.failed_step(), Some((StepName::Design, 3)));
        assert!(matches!(err, EngineError::StepFailed { retryable: true, .. }));
        assert_eq!(ctx.current_step_index, Some(1));
        assert_eq!(ctx.current_attempts, 3);
        assert!(ctx.history.is_empty());
        assert_eq!(ledger.len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_outcome_stops_retrying() {
        let ledger = Arc::new(InMemoryLedger::new());
        let runner = runner(ledger.clone(), Arc::new(CollectingEventSink::new()));
        let calls = AtomicU32::new(0);
        let step = FnStep::new("fatal", |_ctx: PipelineContext, calls: &AtomicU32| {
            calls.fetch_add(1, Ordering::SeqCst);
            Outcome::Fatal(StepFailure::new("bad input"))
        });
        let mut ctx = PipelineContext::new(RunId::new("r1"));

        let err = runner
            .run_step(StepName::Product, &step, &mut ctx, &calls)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::StepFailed { retryable: false, attempts: 1, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_continues_attempt_numbering_after_prior_failures() {
        let ledger = Arc::new(InMemoryLedger::new());
        let runner = runner(ledger.clone(), Arc::new(CollectingEventSink::new()));
        let mut ctx = PipelineContext::new(RunId::new("r1"));
        ctx.next_step_index = 2;
        ctx.current_step_index = Some(1);
        ctx.current_step_name = Some(StepName::Design);
        ctx.current_attempts = 3;

        runner
            .run_step(StepName::Design, &crate::steps::DesignStep, &mut ctx, &())
            .await
            .unwrap();

        let rows = ledger.history(&RunId::new("r1")).await.unwrap();
        assert_eq!(statuses(&rows), vec![(1, 4, AttemptStatus::Ok)]);
        assert_eq!(ctx.next_step_index, 2);
    }

    #[tokio::test]
    async fn test_skips_before_resume_point_until_consumed() {
        let ledger = Arc::new(InMemoryLedger::new());
        let events = Arc::new(CollectingEventSink::new());
        let runner = runner(ledger.clone(), events.clone());
        let mut ctx = PipelineContext::new(RunId::new("r1")).starting_at(StepName::Design);

        let skipped = runner
            .run_step(StepName::Product, &ProductStep, &mut ctx, &())
            .await
            .unwrap();
        assert_eq!(skipped, StepRun::Skipped);
        assert!(ledger.is_empty());

        runner
            .run_step(StepName::Design, &crate::steps::DesignStep, &mut ctx, &())
            .await
            .unwrap();
        assert!(ctx.resume_consumed);

        // Once consumed, earlier steps run again (loop trips).
        let again = runner
            .run_step(StepName::Product, &ProductStep, &mut ctx, &())
            .await
            .unwrap();
        assert_eq!(again, StepRun::Completed);
        assert_eq!(events.event_types()[0], "step.skipped");
    }

    #[tokio::test]
    async fn test_step_cannot_move_rows_to_another_run() {
        let ledger = Arc::new(InMemoryLedger::new());
        let runner = runner(ledger.clone(), Arc::new(CollectingEventSink::new()));
        let step = FnStep::new("rename", |mut ctx: PipelineContext, _deps: &()| {
            ctx.run_id = RunId::new("other");
            Outcome::Ok(ctx)
        });
        let mut ctx = PipelineContext::new(RunId::new("mine"));

        runner
            .run_step(StepName::Product, &step, &mut ctx, &())
            .await
            .unwrap();
        runner
            .run_step(StepName::Design, &crate::steps::DesignStep, &mut ctx, &())
            .await
            .unwrap();

        assert_eq!(ctx.run_id, RunId::new("mine"));
        let mine = ledger.history(&RunId::new("mine")).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|r| r.run_id == RunId::new("mine")));
        assert!(ledger.history(&RunId::new("other")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_halted_context_is_a_no_op() {
        let ledger = Arc::new(InMemoryLedger::new());
        let runner = runner(ledger.clone(), Arc::new(CollectingEventSink::new()));
        let mut ctx = PipelineContext::new(RunId::new("r1"));
        ctx.early_stop = true;

        let run = runner
            .run_step(StepName::Product, &ProductStep, &mut ctx, &())
            .await
            .unwrap();
        assert_eq!(run, StepRun::Halted);
        assert!(ledger.is_empty());
    }
}
