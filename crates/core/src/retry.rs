//! Retry and backoff utilities for container runtime and guest operations
//!
//! Each call site instantiates its own [`RetryPolicy`] and hands the operation
//! to [`retry_async`]; there is no retry state living outside the call.

use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry immediately
    #[default]
    None,
    /// The same delay before every retry
    Fixed(Duration),
    /// `step × retry_number` before each retry (10s, 20s, 30s, ...)
    Linear(Duration),
}

impl Backoff {
    /// Delay before the given retry (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Linear(step) => step.saturating_mul(retry),
        }
    }
}

/// Bounded-attempt retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (excluding initial attempt)
    pub max_attempts: u32,
    /// Delay schedule between attempts
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Backoff::None)
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed(delay))
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self::new(max_attempts, Backoff::Linear(step))
    }

    /// Sum of all delays if every attempt fails.
    pub fn worst_case_delay(&self) -> Duration {
        (1..=self.max_attempts)
            .map(|retry| self.backoff.delay(retry))
            .sum()
    }
}

/// Error classification result for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Do not retry (terminal error)
    Stop,
}

/// Error classifier function type
pub type ErrorClassifier<E> = fn(&E) -> RetryDecision;

/// Default error classifier that retries on all errors
pub fn default_classifier<E>(_error: &E) -> RetryDecision {
    RetryDecision::Retry
}

/// Retry an async operation according to `policy`.
///
/// Returns the first success, the first error the classifier stops on, or the
/// last error once all attempts are spent.
#[instrument(level = "debug", skip(operation, classify_error))]
pub async fn retry_async<T, E, Fut, Op>(
    policy: &RetryPolicy,
    operation: Op,
    classify_error: ErrorClassifier<E>,
) -> std::result::Result<T, E>
where
    Op: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut attempt = 0;
    loop {
        debug!("Retry attempt {} of {}", attempt, policy.max_attempts);

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded on attempt {}", attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                debug!("Operation failed on attempt {}: {:?}", attempt, error);

                if classify_error(&error) == RetryDecision::Stop {
                    debug!("Error classifier indicated stop, not retrying");
                    return Err(error);
                }

                if attempt >= policy.max_attempts {
                    warn!(
                        "All {} retry attempts exhausted, final error: {:?}",
                        policy.max_attempts + 1,
                        error
                    );
                    return Err(error);
                }

                attempt += 1;
                let delay = policy.backoff.delay(attempt);
                debug!("Sleeping for {:?} before next attempt", delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
