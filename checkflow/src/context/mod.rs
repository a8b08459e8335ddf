//! Context management for pipeline execution.
//!
//! This module provides:
//! - The mutable pipeline context threaded through every step
//! - Minimal snapshots persisted with each ledger attempt

mod pipeline;
mod snapshot;

pub use pipeline::{Artifacts, PipelineContext, QaVerdict, RunControls, SharedNote};
pub use snapshot::ContextSnapshot;
