//! # Checkflow
//!
//! Durable, checkpointed execution of a fixed multi-step pipeline.
//!
//! Every attempt of every step is written to an append-only attempt ledger
//! before the run moves on, so a run can be paused, can crash, and can be
//! resumed from the ledger alone:
//!
//! - **Attempt ledger**: one row per attempt, keyed by `(run_id, step_index, attempt)`
//! - **Retry executor**: exponential backoff, retryable vs fatal outcomes
//! - **Step runner**: resume skipping, fault injection, ledger writes
//! - **Drivers**: a checkpointed graph driver and a sequential fallback
//! - **Resume coordinator**: rebuilds a context from ledger history
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use checkflow::prelude::*;
//!
//! let engine = Engine::builder(())
//!     .with_checkpointer(Arc::new(MemoryCheckpointer::new()))
//!     .build()?;
//!
//! let paused = engine
//!     .start("run-1", StartOptions::new().with_stop_after(StepName::Research))
//!     .await?;
//! assert_eq!(paused.status, RunStatus::Paused);
//!
//! let done = engine.resume("run-1", ResumeOptions::new()).await?;
//! assert_eq!(done.status, RunStatus::Succeeded);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod context;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod observability;
pub mod pipeline;
pub mod steps;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::{Artifacts, ContextSnapshot, PipelineContext, QaVerdict, RunControls};
    pub use crate::core::{AttemptStatus, RunId, RunStatus, StepName, STEP_ORDER};
    pub use crate::engine::{Engine, EngineBuilder, EngineConfig, FinalState, ResumeOptions, StartOptions};
    pub use crate::errors::{CheckpointError, EngineError, LedgerError, StepFailure};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::ledger::{AttemptLedger, AttemptRecord, HistoryEntry, InMemoryLedger};
    #[cfg(feature = "sqlite")]
    pub use crate::ledger::SqliteLedger;
    pub use crate::pipeline::{
        Checkpointer, DriverKind, MemoryCheckpointer, Outcome, RetryPolicy,
    };
    pub use crate::steps::{AsyncFnStep, FnStep, Step, StepOutcome, StepSet};
}
