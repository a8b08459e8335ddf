//! Attempt and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome recorded for a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// The attempt completed and the step's output was committed.
    Ok,
    /// The attempt failed (injected fault, step failure, or fatal outcome).
    Error,
}

impl AttemptStatus {
    /// Returns true if the attempt succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns the stored string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown attempt status '{other}'")),
        }
    }
}

/// How a `start` or `resume` call ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run reached the terminal step.
    Succeeded,
    /// The run halted early because of `stop_after`.
    Paused,
}

impl RunStatus {
    /// Returns true if the run has no work left.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_status_display() {
        assert_eq!(AttemptStatus::Ok.to_string(), "ok");
        assert_eq!(AttemptStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_attempt_status_parse() {
        assert_eq!("ok".parse::<AttemptStatus>(), Ok(AttemptStatus::Ok));
        assert_eq!("error".parse::<AttemptStatus>(), Ok(AttemptStatus::Error));
        assert!("retry".parse::<AttemptStatus>().is_err());
    }

    #[test]
    fn test_attempt_status_serialize() {
        let json = serde_json::to_string(&AttemptStatus::Error).unwrap();
        assert_eq!(json, r#""error""#);

        let deserialized: AttemptStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, AttemptStatus::Error);
    }

    #[test]
    fn test_run_status_is_terminal() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert_eq!(RunStatus::Paused.to_string(), "paused");
    }
}
