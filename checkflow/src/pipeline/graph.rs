//! Checkpointed graph driver.
//!
//! Walks the step graph from its entry node, writing a checkpoint of the
//! full context after every visit under `thread_id = run_id`. Nodes that
//! ran in an earlier invocation are passed over by the step runner, so a
//! resumed run re-enters the graph at `product` and fast-forwards.
//!
//! Checkpoints are an audit trail of graph visits. Resume and state reads
//! go through the attempt ledger only; nothing reads a checkpoint back to
//! decide what runs next.

use super::driver::{DriverKind, PipelineDriver, Router};
use super::runner::{StepRun, StepRunner};
use crate::context::PipelineContext;
use crate::core::{RunId, StepName};
use crate::errors::{CheckpointError, EngineError};
use crate::steps::StepSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Full-context checkpoint written after a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The run (graph thread).
    pub thread_id: RunId,
    /// Position of this checkpoint in the thread, starting at 0.
    pub sequence: u64,
    /// The node just visited.
    pub step: StepName,
    /// The node the graph goes to next, if any.
    pub next: Option<StepName>,
    /// The context after the visit.
    pub context: PipelineContext,
    /// When the checkpoint was written.
    pub created_at: DateTime<Utc>,
}

/// Storage for graph checkpoints.
///
/// Write-mostly: the engine asks for readiness once per invocation and then
/// appends. `latest` and `list` serve inspection through
/// [`crate::engine::Engine::get_checkpoints`].
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Fails with `Unavailable` if checkpoints cannot be written right now.
    async fn ensure_ready(&self) -> Result<(), CheckpointError>;

    /// Appends a checkpoint. The sequence number is assigned by the store.
    async fn put(
        &self,
        thread_id: &RunId,
        step: StepName,
        next: Option<StepName>,
        context: &PipelineContext,
    ) -> Result<Checkpoint, CheckpointError>;

    /// Returns the newest checkpoint of a thread.
    async fn latest(&self, thread_id: &RunId) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Returns every checkpoint of a thread in write order.
    async fn list(&self, thread_id: &RunId) -> Result<Vec<Checkpoint>, CheckpointError>;
}

/// In-process checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    threads: DashMap<RunId, Vec<Checkpoint>>,
}

impl MemoryCheckpointer {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn ensure_ready(&self) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn put(
        &self,
        thread_id: &RunId,
        step: StepName,
        next: Option<StepName>,
        context: &PipelineContext,
    ) -> Result<Checkpoint, CheckpointError> {
        let mut thread = self.threads.entry(thread_id.clone()).or_default();
        let checkpoint = Checkpoint {
            thread_id: thread_id.clone(),
            sequence: thread.len() as u64,
            step,
            next,
            context: context.clone(),
            created_at: Utc::now(),
        };
        thread.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn latest(&self, thread_id: &RunId) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .threads
            .get(thread_id)
            .and_then(|thread| thread.last().cloned()))
    }

    async fn list(&self, thread_id: &RunId) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self
            .threads
            .get(thread_id)
            .map(|thread| thread.clone())
            .unwrap_or_default())
    }
}

/// The checkpointed driver.
#[derive(Clone)]
pub struct GraphDriver {
    runner: StepRunner,
    checkpointer: Arc<dyn Checkpointer>,
    entry: StepName,
}

impl std::fmt::Debug for GraphDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDriver")
            .field("runner", &self.runner)
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

impl GraphDriver {
    /// Creates a graph driver entering at `product`.
    ///
    /// The caller checks [`Checkpointer::ensure_ready`] before driving.
    #[must_use]
    pub fn new(runner: StepRunner, checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self {
            runner,
            checkpointer,
            entry: StepName::Product,
        }
    }

    /// Returns the checkpoint store.
    #[must_use]
    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }
}

#[async_trait]
impl<D: Send + Sync> PipelineDriver<D> for GraphDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Graph
    }

    async fn drive(
        &self,
        mut ctx: PipelineContext,
        steps: &StepSet<D>,
        deps: &D,
    ) -> Result<PipelineContext, EngineError> {
        let mut router = Router::new();
        let mut node = Some(self.entry);
        while let Some(step) = node {
            let run = self
                .runner
                .run_step(step, steps.get(step), &mut ctx, deps)
                .await?;
            node = match run {
                StepRun::Halted => None,
                StepRun::Skipped => Router::after_skipped(step),
                StepRun::Completed => {
                    let next = router.after_completed(step, &ctx);
                    let checkpoint = self.checkpointer.put(&ctx.run_id, step, next, &ctx).await?;
                    tracing::debug!(
                        run_id = %ctx.run_id,
                        step = %step,
                        sequence = checkpoint.sequence,
                        "Checkpoint written"
                    );
                    next
                }
            };
        }
        Ok(ctx)
    }
}
