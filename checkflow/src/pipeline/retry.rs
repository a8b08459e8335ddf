//! Retry utilities with exponential backoff.
//!
//! The executor knows nothing about steps, the ledger or the pipeline. An
//! operation reports each attempt as an [`Outcome`]; `Retryable` failures
//! are retried after a backoff sleep until the attempt budget is spent,
//! `Fatal` failures stop immediately.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    /// The attempt succeeded.
    Ok(T),
    /// The attempt failed and may be retried.
    Retryable(E),
    /// The attempt failed and must not be retried.
    Fatal(E),
}

impl<T, E> Outcome<T, E> {
    /// Returns true for `Ok`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Maps the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U, E> {
        match self {
            Self::Ok(v) => Outcome::Ok(f(v)),
            Self::Retryable(e) => Outcome::Retryable(e),
            Self::Fatal(e) => Outcome::Fatal(e),
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    /// Plain errors are treated as transient.
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Self::Ok(v),
            Err(e) => Self::Retryable(e),
        }
    }
}

/// Why the executor gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        error: E,
    },
    /// An attempt failed with a fatal error.
    Fatal {
        /// Attempts made, including the fatal one.
        attempts: u32,
        /// The fatal error.
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Fatal { attempts, .. } => *attempts,
        }
    }

    /// Consumes the error and returns the last failure.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { error, .. } | Self::Fatal { error, .. } => error,
        }
    }
}

/// Jitter strategy applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact backoff delays.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Factor applied to the delay for each further retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    20
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy (3 attempts, 20ms base, x2 backoff).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy with no sleeps between attempts.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns a description of the first invalid setting, if any.
    #[must_use]
    pub fn validate(&self) -> Option<String> {
        if self.max_attempts == 0 {
            return Some("retry.max_attempts must be at least 1".to_string());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 0.0 {
            return Some(format!(
                "retry.backoff_multiplier must be a positive number, got {}",
                self.backoff_multiplier
            ));
        }
        None
    }

    /// Sleep before retrying after the given failed attempt (1-based):
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay_ms`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64).max(0.0) as u64
        } else {
            self.max_delay_ms
        };

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => {
                if capped == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=capped)
                }
            }
            JitterStrategy::Equal => {
                let half = capped / 2;
                if half == 0 {
                    capped
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// An operation driven by [`execute`].
///
/// Implemented by types that need to borrow state mutably across attempts,
/// which a closure returning a future cannot do.
#[async_trait]
pub trait RetryableOperation: Send {
    /// Success value.
    type Output: Send;
    /// Failure value.
    type Error: Send + std::fmt::Display;

    /// Runs one attempt. `attempt` is 1-based within this executor call.
    async fn attempt(&mut self, attempt: u32) -> Outcome<Self::Output, Self::Error>;
}

enum Settled<T, E> {
    Done(Result<T, RetryError<E>>),
    RetryAfter(Duration),
}

/// Decides what happens after one attempt: mirrors the budget and backoff
/// rules for both the trait and closure entry points.
fn settle<T, E: std::fmt::Display>(
    policy: &RetryPolicy,
    attempt: u32,
    outcome: Outcome<T, E>,
) -> Settled<T, E> {
    match outcome {
        Outcome::Ok(value) => Settled::Done(Ok(value)),
        Outcome::Fatal(error) => {
            tracing::debug!(attempt, error = %error, "Giving up after fatal error");
            Settled::Done(Err(RetryError::Fatal {
                attempts: attempt,
                error,
            }))
        }
        Outcome::Retryable(error) => {
            if attempt >= policy.max_attempts.max(1) {
                tracing::debug!(attempt, error = %error, "Retry budget exhausted");
                return Settled::Done(Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                }));
            }
            let delay = policy.delay_for(attempt);
            tracing::debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying after error"
            );
            Settled::RetryAfter(delay)
        }
    }
}

/// Runs `operation` until it succeeds, fails fatally, or the policy's
/// attempt budget is spent.
pub async fn execute<Op>(
    policy: &RetryPolicy,
    operation: &mut Op,
) -> Result<Op::Output, RetryError<Op::Error>>
where
    Op: RetryableOperation + ?Sized,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = operation.attempt(attempt).await;
        match settle(policy, attempt, outcome) {
            Settled::Done(result) => return result,
            Settled::RetryAfter(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Closure form of [`execute`] for operations that own their state.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Outcome<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = operation(attempt).await;
        match settle(policy, attempt, outcome) {
            Settled::Done(result) => return result,
            Settled::RetryAfter(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 20);
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(policy.jitter, JitterStrategy::None);
        assert!(policy.validate().is_none());
    }

    #[test]
    fn test_delay_is_exponential() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        assert_eq!(policy.delay_for(3), Duration::from_millis(80));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000);
        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_stays_below_delay() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff_multiplier(1.0)
            .with_jitter(JitterStrategy::Full);
        for _ in 0..20 {
            assert!(policy.delay_for(1) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(RetryPolicy::new().with_max_attempts(0).validate().is_some());
        assert!(RetryPolicy::new()
            .with_backoff_multiplier(f64::NAN)
            .validate()
            .is_some());
        assert!(RetryPolicy::new()
            .with_backoff_multiplier(0.0)
            .validate()
            .is_some());
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<i32, RetryError<String>> =
            with_retry(&RetryPolicy::immediate(3), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Outcome::Ok(42) }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let result: Result<u32, RetryError<String>> =
            with_retry(&RetryPolicy::immediate(3), |attempt| async move {
                if attempt < 3 {
                    Outcome::Retryable(format!("attempt {attempt}"))
                } else {
                    Outcome::Ok(attempt)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let result: Result<(), RetryError<String>> =
            with_retry(&RetryPolicy::immediate(3), |attempt| async move {
                Outcome::Retryable(format!("attempt {attempt}"))
            })
            .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                error: "attempt 3".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_fatal_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), RetryError<String>> =
            with_retry(&RetryPolicy::immediate(5), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Outcome::Fatal("bad input".to_string()) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.into_inner(), "bad input");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_sleeps_between_attempts() {
        let start = std::time::Instant::now();
        let _ = with_retry(&RetryPolicy::new(), |_| async {
            Outcome::<(), _>::Retryable("down".to_string())
        })
        .await;

        // 20ms + 40ms before the second and third attempts.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: Outcome<i32, String> = Ok(1).into();
        let err: Outcome<i32, String> = Err("x".to_string()).into();
        assert!(ok.is_ok());
        assert_eq!(err, Outcome::Retryable("x".to_string()));
        assert_eq!(Outcome::<i32, String>::Ok(2).map(|v| v * 2), Outcome::Ok(4));
    }
}
