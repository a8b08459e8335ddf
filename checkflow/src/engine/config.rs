//! Engine configuration.

use crate::errors::EngineError;
use crate::pipeline::{DriverKind, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Settings shared by every run an engine executes.
///
/// ```toml
/// driver = "sequential"
/// default_max_qa_loops = 3
///
/// [retry]
/// max_attempts = 5
/// base_delay_ms = 50
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry budget and backoff applied to every step.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Driver selection.
    #[serde(default)]
    pub driver: DriverKind,
    /// Loop bound used when start options leave it unset.
    #[serde(default = "default_max_qa_loops")]
    pub default_max_qa_loops: u32,
}

fn default_max_qa_loops() -> u32 {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            driver: DriverKind::default(),
            default_max_qa_loops: default_max_qa_loops(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, EngineError> {
        let config: Self =
            toml::from_str(source).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the driver selection.
    #[must_use]
    pub fn with_driver(mut self, driver: DriverKind) -> Self {
        self.driver = driver;
        self
    }

    /// Sets the default qa loop bound.
    #[must_use]
    pub fn with_default_max_qa_loops(mut self, loops: u32) -> Self {
        self.default_max_qa_loops = loops;
        self
    }

    /// Rejects settings no run could execute under.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self.retry.validate() {
            Some(problem) => Err(EngineError::Config(problem)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::JitterStrategy;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_document_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.driver, DriverKind::Auto);
        assert_eq!(config.default_max_qa_loops, 2);
    }

    #[test]
    fn test_partial_document() {
        let config = EngineConfig::from_toml_str(
            r#"
            driver = "sequential"
            default_max_qa_loops = 4

            [retry]
            max_attempts = 5
            jitter = "full"
            "#,
        )
        .unwrap();

        assert_eq!(config.driver, DriverKind::Sequential);
        assert_eq!(config.default_max_qa_loops, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 20);
        assert_eq!(config.retry.jitter, JitterStrategy::Full);
    }

    #[test]
    fn test_invalid_documents_are_config_errors() {
        let zero = EngineConfig::from_toml_str("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(zero, EngineError::Config(_)));
        assert!(zero.is_caller_error());

        let bad_driver = EngineConfig::from_toml_str("driver = \"dag\"\n").unwrap_err();
        assert!(matches!(bad_driver, EngineError::Config(_)));
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::new()
            .with_retry(RetryPolicy::immediate(1))
            .with_driver(DriverKind::Graph)
            .with_default_max_qa_loops(1);
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.base_delay_ms, 0);
        assert_eq!(config.driver, DriverKind::Graph);
    }
}
