//! Lifecycle events emitted by the engine.
//!
//! Sinks receive an event type (e.g. `step.completed`) and an optional JSON
//! payload. Emission never fails and never affects the run.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::{RunId, StepName};
use serde_json::{json, Value};

/// A run began executing from scratch.
pub const RUN_STARTED: &str = "run.started";
/// A run continued from its ledger.
pub const RUN_RESUMED: &str = "run.resumed";
/// A step was passed over because it ran before the resume point.
pub const STEP_SKIPPED: &str = "step.skipped";
/// One attempt of a step failed.
pub const STEP_ATTEMPT_FAILED: &str = "step.attempt_failed";
/// A step produced its ok row.
pub const STEP_COMPLETED: &str = "step.completed";
/// A run halted early on request.
pub const RUN_PAUSED: &str = "run.paused";
/// A run reached the terminal step.
pub const RUN_COMPLETED: &str = "run.completed";
/// A run stopped on an error.
pub const RUN_FAILED: &str = "run.failed";
/// The checkpointed driver was unavailable and the sequential one ran.
pub const DRIVER_FALLBACK: &str = "driver.fallback";

/// Payload shared by the step-level events.
pub(crate) fn step_payload(run_id: &RunId, step: StepName, step_index: u64) -> Value {
    json!({
        "run_id": run_id,
        "step": step,
        "step_index": step_index,
    })
}
