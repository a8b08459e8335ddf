//! Self-contained sequential driver.
//!
//! Needs nothing beyond the ledger: it starts directly at the context's
//! resume point and walks the fixed order with the same routing rule as
//! the graph driver.

use super::driver::{DriverKind, PipelineDriver, Router};
use super::runner::{StepRun, StepRunner};
use crate::context::PipelineContext;
use crate::core::StepName;
use crate::errors::EngineError;
use crate::steps::StepSet;
use async_trait::async_trait;

/// Runs steps in a plain loop without checkpoints.
#[derive(Debug, Clone)]
pub struct SequentialDriver {
    runner: StepRunner,
}

impl SequentialDriver {
    /// Creates a sequential driver.
    #[must_use]
    pub fn new(runner: StepRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<D: Send + Sync> PipelineDriver<D> for SequentialDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sequential
    }

    async fn drive(
        &self,
        mut ctx: PipelineContext,
        steps: &StepSet<D>,
        deps: &D,
    ) -> Result<PipelineContext, EngineError> {
        let mut router = Router::new();
        let mut current = if ctx.resume_consumed {
            Some(StepName::Product)
        } else {
            StepName::at(ctx.resume_pointer)
        };

        while let Some(step) = current {
            current = match self
                .runner
                .run_step(step, steps.get(step), &mut ctx, deps)
                .await?
            {
                StepRun::Halted => None,
                StepRun::Skipped => Router::after_skipped(step),
                StepRun::Completed => router.after_completed(step, &ctx),
            };
        }
        Ok(ctx)
    }
}
