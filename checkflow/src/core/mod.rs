//! Core domain types for checkflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - The fixed step topology
//! - Attempt and run status enums
//! - Run identity

mod identity;
mod status;
mod step_name;

pub use identity::RunId;
pub use status::{AttemptStatus, RunStatus};
pub use step_name::{StepName, STEP_ORDER};
