//! The mutable state threaded through every step of a run.

use super::ContextSnapshot;
use crate::core::{RunId, StepName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The qa step's pass/fail judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaVerdict {
    /// Whether the change passed.
    pub passed: bool,
    /// The qa attempt this verdict belongs to.
    pub attempts: u32,
}

/// Business artifacts, one per producing step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    /// Product requirements (product).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd: Option<serde_json::Value>,
    /// Design review (design).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<serde_json::Value>,
    /// Research summary (research).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research: Option<serde_json::Value>,
    /// Technical plan (planning).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<serde_json::Value>,
    /// Code patch (engineer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_patch: Option<String>,
    /// Latest qa verdict (qa).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_result: Option<QaVerdict>,
    /// Release information (release).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_info: Option<serde_json::Value>,
}

/// A note appended by a step to the shared notes area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedNote {
    /// The step that wrote the note.
    pub step: StepName,
    /// Free-form note text.
    pub note: String,
}

impl SharedNote {
    /// Creates a new note.
    #[must_use]
    pub fn new(step: StepName, note: impl Into<String>) -> Self {
        Self {
            step,
            note: note.into(),
        }
    }
}

/// Test-control knobs for the backtrack loop. Persisted with every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunControls {
    /// Make qa fail until the loop bound is reached.
    #[serde(default)]
    pub force_qa_fail: bool,
    /// Upper bound on qa attempts.
    #[serde(default = "default_max_qa_loops")]
    pub max_qa_loops: u32,
}

fn default_max_qa_loops() -> u32 {
    2
}

impl Default for RunControls {
    fn default() -> Self {
        Self {
            force_qa_fail: false,
            max_qa_loops: default_max_qa_loops(),
        }
    }
}

/// The unit of work state for a run.
///
/// Owned by the driver for the duration of a run and lent mutably to the
/// step runner one step at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    /// The run this context belongs to.
    pub run_id: RunId,
    /// Step names actually executed, in order. Append-only.
    #[serde(default)]
    pub history: Vec<StepName>,
    /// Business artifacts.
    #[serde(default)]
    pub artifacts: Artifacts,
    /// Notes any step may append to. Never pruned.
    #[serde(default)]
    pub shared_notes: Vec<SharedNote>,
    /// Number of qa visits. Incremented only by the qa step.
    #[serde(default)]
    pub qa_attempts: u32,
    /// Backtrack loop controls.
    #[serde(default)]
    pub controls: RunControls,
    /// Remaining forced failures per step. Decremented on use.
    #[serde(default)]
    pub inject_failures: BTreeMap<StepName, u32>,
    /// Halt the run after this step completes.
    #[serde(default)]
    pub stop_after: Option<StepName>,
    /// Ledger step index the next step will be assigned.
    #[serde(default)]
    pub next_step_index: u64,
    /// Index stamped on the step currently mid-retry.
    #[serde(default)]
    pub current_step_index: Option<u64>,
    /// Name of the step currently mid-retry.
    #[serde(default)]
    pub current_step_name: Option<StepName>,
    /// Attempts already spent on the step currently mid-retry.
    #[serde(default)]
    pub current_attempts: u32,
    /// Set once the run must halt; remaining steps become no-ops.
    #[serde(default)]
    pub early_stop: bool,
    /// Fixed-order position the run resumes at. Zero for fresh runs.
    #[serde(default)]
    pub resume_pointer: usize,
    /// Set once the first step at or past `resume_pointer` executed.
    #[serde(default)]
    pub resume_consumed: bool,
}

impl PipelineContext {
    /// Creates a fresh context for a new run.
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            history: Vec::new(),
            artifacts: Artifacts::default(),
            shared_notes: Vec::new(),
            qa_attempts: 0,
            controls: RunControls::default(),
            inject_failures: BTreeMap::new(),
            stop_after: None,
            next_step_index: 0,
            current_step_index: None,
            current_step_name: None,
            current_attempts: 0,
            early_stop: false,
            resume_pointer: 0,
            resume_consumed: false,
        }
    }

    /// Rebuilds a resumable context from a persisted snapshot.
    ///
    /// Bookkeeping fields start cleared; the resume coordinator fills them.
    #[must_use]
    pub fn from_snapshot(snapshot: &ContextSnapshot) -> Self {
        Self {
            history: snapshot.history.clone(),
            artifacts: snapshot.artifacts.clone(),
            shared_notes: snapshot.shared_notes.clone(),
            qa_attempts: snapshot.qa_attempts,
            controls: snapshot.controls,
            ..Self::new(snapshot.run_id.clone())
        }
    }

    /// Sets the backtrack controls.
    #[must_use]
    pub fn with_controls(mut self, controls: RunControls) -> Self {
        self.controls = controls;
        self
    }

    /// Sets the forced failure counts.
    #[must_use]
    pub fn with_inject_failures(mut self, inject: BTreeMap<StepName, u32>) -> Self {
        self.inject_failures = inject;
        self
    }

    /// Sets the step after which the run halts.
    #[must_use]
    pub fn with_stop_after(mut self, step: Option<StepName>) -> Self {
        self.stop_after = step;
        self
    }

    /// Starts the run at `step`, skipping earlier steps.
    #[must_use]
    pub fn starting_at(mut self, step: StepName) -> Self {
        self.next_step_index = step.position() as u64;
        self.resume_pointer = step.position();
        self
    }

    /// Appends a shared note.
    pub fn add_note(&mut self, step: StepName, note: impl Into<String>) {
        self.shared_notes.push(SharedNote::new(step, note));
    }

    /// Returns true if this context was reconstructed for a resume.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resume_pointer > 0
    }

    /// Returns true if the latest qa verdict passed.
    #[must_use]
    pub fn qa_passed(&self) -> bool {
        self.artifacts.tests_result.is_some_and(|v| v.passed)
    }

    /// Returns true if the run reached the terminal step.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.history.last().is_some_and(|s| s.is_terminal())
    }

    /// Stamps `step` as mid-retry at `step_index` and returns the attempts
    /// already spent on it.
    ///
    /// Reuses the existing stamp when the same step is already mid-retry,
    /// so repeated calls for one logical invocation agree on the index.
    pub fn claim_step_index(&mut self, step: StepName) -> (u64, u32) {
        if self.current_step_name == Some(step) {
            if let Some(index) = self.current_step_index {
                return (index, self.current_attempts);
            }
        }
        let index = self.next_step_index;
        self.current_step_index = Some(index);
        self.current_step_name = Some(step);
        self.current_attempts = 0;
        (index, 0)
    }

    /// Advances past a completed step and clears the mid-retry markers.
    pub fn complete_step(&mut self, step: StepName, step_index: u64) {
        self.next_step_index = step_index + 1;
        self.current_step_index = None;
        self.current_step_name = None;
        self.current_attempts = 0;
        if self.stop_after == Some(step) {
            self.early_stop = true;
        }
    }

    /// Takes the minimal resumable projection persisted with each attempt.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot::from_context(self)
    }
}
