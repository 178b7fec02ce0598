//! Transport retry policy: bound, delay, jitter and `Retry-After`.
//!
//! Only transport-level failures are retried. A stream that completes but
//! yields no parsable JSON is terminal and never reaches this policy.

use crate::config::BatchConfig;
use crate::PipelineError;
use std::time::Duration;

/// Jitter strategy to spread retries of items that failed together.
///
/// # Example
///
/// ```
/// use vision_batch::retry::JitterStrategy;
///
/// let jitter = JitterStrategy::Equal;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterStrategy {
    /// No jitter. Delay is exactly `retry_delay`.
    #[default]
    None,

    /// Full jitter: random value in `[0, retry_delay]`.
    Full,

    /// Equal jitter: `retry_delay/2 + random in [0, retry_delay/2]`.
    Equal,
}

/// Per-item retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts are `max_retries + 1`.
    pub max_retries: u32,

    /// Base sleep between attempts.
    pub retry_delay: Duration,

    /// Jitter applied to `retry_delay`. Default: none (fixed delay).
    pub jitter: JitterStrategy,

    /// Sleep at least as long as a provider's `Retry-After`. Default: `true`.
    pub respect_retry_after: bool,
}

impl RetryPolicy {
    /// Policy with a fixed delay, no jitter, honouring `Retry-After`.
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            jitter: JitterStrategy::None,
            respect_retry_after: true,
        }
    }

    /// Policy taken from a batch configuration.
    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay)
    }

    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    /// Whether retry number `retry` (1-indexed) is within the bound.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// Sleep before the next attempt, given the error that ended the last one.
    pub fn delay_for(&self, error: &PipelineError) -> Duration {
        let base = self.retry_delay.as_secs_f64();
        let jittered = match self.jitter {
            JitterStrategy::None => base,
            JitterStrategy::Full => fastrand::f64() * base,
            JitterStrategy::Equal => base / 2.0 + fastrand::f64() * (base / 2.0),
        };
        let delay = Duration::from_secs_f64(jittered);

        match error {
            PipelineError::HttpError {
                retry_after: Some(ra),
                ..
            } if self.respect_retry_after => delay.max(*ra),
            _ => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(0, Duration::from_secs(5))
    }
}

/// Whether an attempt that failed with `error` may be retried.
///
/// Any failure during an attempt is retried, except configuration and input
/// errors (which cannot change between attempts) and cancellation.
pub fn is_retryable(error: &PipelineError) -> bool {
    !matches!(
        error,
        PipelineError::Configuration(_) | PipelineError::Input(_) | PipelineError::Cancelled
    )
}
