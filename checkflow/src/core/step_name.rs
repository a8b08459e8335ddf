//! The fixed step topology.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named step of the fixed pipeline.
///
/// Declaration order is the forward order of the pipeline; `position()`
/// returns the zero-based slot used for resume bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    /// Drafts the product requirements.
    Product,
    /// Reviews the design.
    Design,
    /// Synthesizes research.
    Research,
    /// Produces the technical plan.
    Planning,
    /// Implements the change. Revisited on every backtrack.
    Engineer,
    /// Judges the change. The only step with a conditional out-edge.
    Qa,
    /// Terminal step.
    Release,
}

/// Every step in forward order.
pub const STEP_ORDER: [StepName; 7] = [
    StepName::Product,
    StepName::Design,
    StepName::Research,
    StepName::Planning,
    StepName::Engineer,
    StepName::Qa,
    StepName::Release,
];

impl StepName {
    /// Returns the position of this step in [`STEP_ORDER`].
    #[must_use]
    pub fn position(self) -> usize {
        match self {
            Self::Product => 0,
            Self::Design => 1,
            Self::Research => 2,
            Self::Planning => 3,
            Self::Engineer => 4,
            Self::Qa => 5,
            Self::Release => 6,
        }
    }

    /// Returns the step at `position`, if any.
    #[must_use]
    pub fn at(position: usize) -> Option<Self> {
        STEP_ORDER.get(position).copied()
    }

    /// Returns the step that follows this one on the linear chain.
    ///
    /// `qa` has no unconditional successor and `release` is terminal.
    #[must_use]
    pub fn linear_successor(self) -> Option<Self> {
        match self {
            Self::Qa | Self::Release => None,
            other => Self::at(other.position() + 1),
        }
    }

    /// Returns true for the terminal step.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Release)
    }

    /// Returns true for the steps that may repeat under backtracking.
    #[must_use]
    pub fn is_loop_step(self) -> bool {
        matches!(self, Self::Engineer | Self::Qa)
    }

    /// Returns the canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Design => "design",
            Self::Research => "research",
            Self::Planning => "planning",
            Self::Engineer => "engineer",
            Self::Qa => "qa",
            Self::Release => "release",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STEP_ORDER
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("unknown step '{s}'"))
    }
}
