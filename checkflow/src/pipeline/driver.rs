//! Driver contract and the shared qa routing rule.

use crate::context::PipelineContext;
use crate::core::StepName;
use crate::errors::EngineError;
use crate::steps::StepSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which driver executes a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// The graph driver when a ready checkpointer is configured, else the
    /// sequential driver.
    #[default]
    Auto,
    /// Always the checkpointed graph driver.
    Graph,
    /// Always the sequential driver.
    Sequential,
}

impl DriverKind {
    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Graph => "graph",
            Self::Sequential => "sequential",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "graph" => Ok(Self::Graph),
            "sequential" => Ok(Self::Sequential),
            other => Err(format!("unknown driver '{other}'")),
        }
    }
}

/// Executes a whole run over the fixed topology.
///
/// A driver owns the context for the duration of the run and hands it to
/// the step runner one step at a time. It returns the final context when
/// the terminal step completed or the run was halted early.
#[async_trait]
pub trait PipelineDriver<D>: Send + Sync {
    /// The concrete driver kind (never `Auto`).
    fn kind(&self) -> DriverKind;

    /// Drives `ctx` until release completes, the run halts, or a step fails.
    async fn drive(
        &self,
        ctx: PipelineContext,
        steps: &StepSet<D>,
        deps: &D,
    ) -> Result<PipelineContext, EngineError>;
}

/// Picks the next step after a visit.
///
/// Every edge is unconditional except the one out of `qa`: a passed verdict
/// goes to `release`, a failed one back to `engineer`. After `max_qa_loops`
/// failed verdicts have been routed back in one invocation the router gives
/// up on the loop and goes to `release`.
#[derive(Debug, Clone, Default)]
pub struct Router {
    backtracks: u32,
}

impl Router {
    /// Creates a router with no backtracks taken.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed verdicts routed back to `engineer` so far.
    #[must_use]
    pub fn backtracks(&self) -> u32 {
        self.backtracks
    }

    /// Returns the step after an executed visit of `step`, or `None` when
    /// the run is over.
    pub fn after_completed(&mut self, step: StepName, ctx: &PipelineContext) -> Option<StepName> {
        if ctx.early_stop {
            return None;
        }
        if step != StepName::Qa {
            return step.linear_successor();
        }
        if ctx.qa_passed() {
            return Some(StepName::Release);
        }
        if self.backtracks >= ctx.controls.max_qa_loops {
            tracing::warn!(
                run_id = %ctx.run_id,
                qa_attempts = ctx.qa_attempts,
                max_qa_loops = ctx.controls.max_qa_loops,
                "QA loop bound reached, routing to release"
            );
            return Some(StepName::Release);
        }
        self.backtracks += 1;
        tracing::info!(
            run_id = %ctx.run_id,
            qa_attempts = ctx.qa_attempts,
            "QA failed, backtracking to engineer"
        );
        Some(StepName::Engineer)
    }

    /// Returns the step after a skipped visit of `step`.
    ///
    /// Skipped steps ran in an earlier invocation, so the path simply
    /// continues forward.
    #[must_use]
    pub fn after_skipped(step: StepName) -> Option<StepName> {
        match step {
            StepName::Qa => Some(StepName::Release),
            other => other.linear_successor(),
        }
    }
}
