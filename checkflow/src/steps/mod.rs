//! Step trait and step sets.
//!
//! A step is the business logic of one named slot in the fixed pipeline:
//! `(Context, Deps) -> Context`. Steps never retry and never touch the
//! ledger; the step runner does both around them.

mod builtin;

pub use builtin::{
    DesignStep, EngineerStep, PlanningStep, ProductStep, QaStep, ReleaseStep, ResearchStep,
};

use crate::context::PipelineContext;
use crate::core::{StepName, STEP_ORDER};
use crate::errors::StepFailure;
use crate::pipeline::Outcome;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::sync::Arc;

/// What a step returns: the updated context, or a retryable/fatal failure.
pub type StepOutcome = Outcome<PipelineContext, StepFailure>;

/// Trait for pipeline steps.
#[async_trait]
pub trait Step<D>: Send + Sync + Debug {
    /// Runs the step against an owned copy of the context.
    ///
    /// A failed attempt's copy is discarded, so partial writes never leak
    /// into the run's context.
    async fn run(&self, ctx: PipelineContext, deps: &D) -> StepOutcome;
}

/// A step backed by a synchronous closure.
pub struct FnStep<F> {
    label: String,
    func: F,
}

impl<F> FnStep<F> {
    /// Creates a new function-based step.
    pub fn new(label: impl Into<String>, func: F) -> Self {
        Self {
            label: label.into(),
            func,
        }
    }
}

impl<F> Debug for FnStep<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep").field("label", &self.label).finish()
    }
}

#[async_trait]
impl<D, F> Step<D> for FnStep<F>
where
    D: Send + Sync,
    F: Fn(PipelineContext, &D) -> StepOutcome + Send + Sync,
{
    async fn run(&self, ctx: PipelineContext, deps: &D) -> StepOutcome {
        (self.func)(ctx, deps)
    }
}

/// A step backed by an async closure.
pub struct AsyncFnStep<F> {
    label: String,
    func: F,
}

impl<F> AsyncFnStep<F> {
    /// Creates a new async function-based step.
    pub fn new<D>(label: impl Into<String>, func: F) -> Self
    where
        F: for<'a> Fn(PipelineContext, &'a D) -> BoxFuture<'a, StepOutcome>,
    {
        Self {
            label: label.into(),
            func,
        }
    }
}

impl<F> Debug for AsyncFnStep<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnStep")
            .field("label", &self.label)
            .finish()
    }
}

#[async_trait]
impl<D, F> Step<D> for AsyncFnStep<F>
where
    D: Send + Sync,
    F: for<'a> Fn(PipelineContext, &'a D) -> BoxFuture<'a, StepOutcome> + Send + Sync,
{
    async fn run(&self, ctx: PipelineContext, deps: &D) -> StepOutcome {
        (self.func)(ctx, deps).await
    }
}

/// One step implementation per slot of the fixed order.
pub struct StepSet<D> {
    steps: [Arc<dyn Step<D>>; 7],
}

impl<D> Clone for StepSet<D> {
    fn clone(&self) -> Self {
        Self {
            steps: self.steps.clone(),
        }
    }
}

impl<D> Debug for StepSet<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(STEP_ORDER.iter().zip(self.steps.iter()))
            .finish()
    }
}

impl<D: Send + Sync + 'static> StepSet<D> {
    /// The deterministic built-in implementation of every step.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            steps: [
                Arc::new(ProductStep),
                Arc::new(DesignStep),
                Arc::new(ResearchStep),
                Arc::new(PlanningStep),
                Arc::new(EngineerStep),
                Arc::new(QaStep),
                Arc::new(ReleaseStep),
            ],
        }
    }

    /// Replaces the implementation of one slot.
    #[must_use]
    pub fn with_step(mut self, name: StepName, step: impl Step<D> + 'static) -> Self {
        self.steps[name.position()] = Arc::new(step);
        self
    }

    /// Replaces the implementation of one slot with a shared step.
    #[must_use]
    pub fn with_shared_step(mut self, name: StepName, step: Arc<dyn Step<D>>) -> Self {
        self.steps[name.position()] = step;
        self
    }
}

impl<D> StepSet<D> {
    /// Returns the implementation of `name`.
    #[must_use]
    pub fn get(&self, name: StepName) -> &dyn Step<D> {
        self.steps[name.position()].as_ref()
    }
}
