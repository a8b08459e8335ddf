//! Error types for checkflow.
//!
//! Infrastructure failures (ledger, checkpointer) are fatal to a run.
//! Step failures carry the step and attempt context they were raised in.
//! Caller misuse (resuming a finished run, starting twice) is reported
//! as a validation error and never retried.

use crate::core::{RunId, StepName};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A step exhausted its retry budget or returned a fatal outcome.
    #[error("Step '{step}' failed after {attempts} attempt(s) in run {run_id}: {message}")]
    StepFailed {
        /// The run that failed.
        run_id: RunId,
        /// The step that failed.
        step: StepName,
        /// The attempt number of the last failed attempt.
        attempts: u32,
        /// The last error message.
        message: String,
        /// False when the step gave up with a fatal outcome.
        retryable: bool,
    },

    /// The run has no work left.
    #[error("Nothing to resume for run {run_id}")]
    NothingToResume {
        /// The run id.
        run_id: RunId,
    },

    /// The ledger holds no rows for the run.
    #[error("Run {run_id} not found")]
    RunNotFound {
        /// The run id.
        run_id: RunId,
    },

    /// `start` was called for a run that already has ledger rows.
    #[error("Run {run_id} has already been started; use resume")]
    RunAlreadyStarted {
        /// The run id.
        run_id: RunId,
    },

    /// Another `start`/`resume` call is currently executing the run.
    #[error("Run {run_id} is currently executing")]
    RunActive {
        /// The run id.
        run_id: RunId,
    },

    /// A ledger operation failed.
    #[error("{0}")]
    Ledger(#[from] LedgerError),

    /// A checkpointer operation failed.
    #[error("{0}")]
    Checkpoint(#[from] CheckpointError),

    /// The engine configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Returns true for errors caused by how the caller used the engine.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NothingToResume { .. }
                | Self::RunNotFound { .. }
                | Self::RunAlreadyStarted { .. }
                | Self::RunActive { .. }
                | Self::Config(_)
        )
    }

    /// Returns the failed step and its attempt count, if this is a step failure.
    #[must_use]
    pub fn failed_step(&self) -> Option<(StepName, u32)> {
        match self {
            Self::StepFailed { step, attempts, .. } => Some((*step, *attempts)),
            _ => None,
        }
    }

    /// Converts to a JSON detail body suitable for an API response.
    #[must_use]
    pub fn to_detail(&self) -> serde_json::Value {
        match self {
            Self::StepFailed {
                run_id,
                step,
                attempts,
                message,
                ..
            } => serde_json::json!({
                "status": "failed",
                "run_id": run_id,
                "failed_step": step,
                "attempts": attempts,
                "error": message,
            }),
            Self::NothingToResume { run_id } => serde_json::json!({
                "error": "Nothing to resume",
                "run_id": run_id,
            }),
            other => serde_json::json!({ "error": other.to_string() }),
        }
    }
}

/// The failure payload produced by a step or an injected fault.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct StepFailure {
    /// The error message recorded in the ledger.
    pub message: String,
}

impl StepFailure {
    /// Creates a new step failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The synthetic failure used by fault injection.
    #[must_use]
    pub fn injected(step: StepName) -> Self {
        Self::new(format!("Injected failure at {step}"))
    }
}

/// Errors raised by an attempt ledger.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The `(run_id, step_index, attempt)` key already exists.
    #[error("Duplicate attempt ({run_id}, {step_index}, {attempt})")]
    DuplicateAttempt {
        /// The run id.
        run_id: RunId,
        /// The step index.
        step_index: u64,
        /// The attempt number.
        attempt: u32,
    },

    /// The storage layer failed.
    #[error("Ledger storage error: {0}")]
    Storage(String),

    /// A stored row could not be encoded or decoded.
    #[error("Ledger serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised by a checkpointer.
#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    /// The checkpoint backend cannot be used.
    #[error("Checkpointer unavailable: {0}")]
    Unavailable(String),

    /// A checkpoint could not be written or read.
    #[error("Checkpoint storage error: {0}")]
    Storage(String),
}
