//! Pipeline execution.
//!
//! This module provides:
//! - The retry executor
//! - The step runner that turns a step into ledger-observed attempts
//! - Two drivers over the fixed topology (checkpointed graph, sequential)
//! - The resume coordinator

mod driver;
mod graph;
mod resume;
mod retry;
mod runner;
mod sequential;

pub use driver::{DriverKind, PipelineDriver, Router};
pub use graph::{Checkpoint, Checkpointer, GraphDriver, MemoryCheckpointer};
pub use resume::ResumeCoordinator;
pub use retry::{
    execute, with_retry, JitterStrategy, Outcome, RetryError, RetryPolicy, RetryableOperation,
};
pub use runner::{StepRun, StepRunner};
pub use sequential::SequentialDriver;
