//! Per-endpoint dispatch pacing.

use governor::{DefaultKeyedRateLimiter, Quota};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Enforces a minimum spacing between dispatches to the same endpoint key.
///
/// One keyed GCRA limiter with a burst of one is kept per interval, so two
/// dispatches to a key are never closer than the interval. Waiting is
/// cooperative: callers are delayed, never rejected.
#[derive(Default)]
pub struct RateLimiter {
    limiters: Mutex<HashMap<Duration, Arc<DefaultKeyedRateLimiter<String>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a dispatch to `key` is allowed.
    ///
    /// A zero `min_interval` disables pacing and returns immediately.
    pub async fn wait(&self, key: &str, min_interval: Duration) {
        let Some(limiter) = self.limiter_for(min_interval) else {
            return;
        };
        let key = key.to_string();
        if limiter.check_key(&key).is_ok() {
            return;
        }
        tracing::debug!(
            key = %key,
            interval_ms = min_interval.as_millis() as u64,
            "rate limiter wait"
        );
        limiter.until_key_ready(&key).await;
    }

    fn limiter_for(&self, min_interval: Duration) -> Option<Arc<DefaultKeyedRateLimiter<String>>> {
        let quota = Quota::with_period(min_interval)?.allow_burst(NonZeroU32::MIN);
        // A poisoned map only loses pacing, never the dispatch.
        let mut limiters = self.limiters.lock().ok()?;
        let limiter = limiters
            .entry(min_interval)
            .or_insert_with(|| Arc::new(DefaultKeyedRateLimiter::<String>::keyed(quota)));
        Some(Arc::clone(limiter))
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let intervals: Vec<Duration> = self
            .limiters
            .lock()
            .map(|l| l.keys().copied().collect())
            .unwrap_or_default();
        f.debug_struct("RateLimiter")
            .field("intervals", &intervals)
            .finish()
    }
}
