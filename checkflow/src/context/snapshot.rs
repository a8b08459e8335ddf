//! Minimal resumable projections of a pipeline context.

use super::{Artifacts, PipelineContext, RunControls, SharedNote};
use crate::core::{RunId, StepName};
use serde::{Deserialize, Serialize};

/// The projection of a [`PipelineContext`] persisted with every attempt.
///
/// Carries exactly what resume needs: identity, executed steps, artifacts,
/// the qa counter, shared notes and the backtrack controls. Bookkeeping
/// cursors are not persisted; they are recomputed from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// The run id.
    pub run_id: RunId,
    /// Step history at the moment of the attempt.
    #[serde(default)]
    pub history: Vec<StepName>,
    /// Artifacts produced so far.
    #[serde(default)]
    pub artifacts: Artifacts,
    /// Qa attempt counter.
    #[serde(default)]
    pub qa_attempts: u32,
    /// Shared notes.
    #[serde(default)]
    pub shared_notes: Vec<SharedNote>,
    /// Backtrack controls.
    #[serde(default)]
    pub controls: RunControls,
}

impl ContextSnapshot {
    /// Projects a context.
    #[must_use]
    pub fn from_context(ctx: &PipelineContext) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            history: ctx.history.clone(),
            artifacts: ctx.artifacts.clone(),
            qa_attempts: ctx.qa_attempts,
            shared_notes: ctx.shared_notes.clone(),
            controls: ctx.controls,
        }
    }

    /// Returns the last step recorded in this snapshot's history.
    #[must_use]
    pub fn last_step(&self) -> Option<StepName> {
        self.history.last().copied()
    }
}
