//! Bounded retries with exponential backoff.
//!
//! Every external call in the pipeline goes through [`with_backoff`]. Only
//! transient failures (see [`crate::error::HarvestError::is_transient`]) are
//! retried; a provider-suggested `Retry-After` wins over the computed delay
//! when it is longer, up to [`MAX_RETRY_AFTER`].

use crate::error::Result;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound for random jitter added to each backoff delay
const MAX_JITTER_MS: u64 = 250;

/// Longest provider-suggested wait honoured for one retry
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Backoff schedule for a single external call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Cap for any single delay
    pub max_delay: Duration,
    /// Add up to `MAX_JITTER_MS` of random jitter
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let mut delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter {
            delay += Duration::from_millis(rand::random::<u64>() % MAX_JITTER_MS);
        }
        delay
    }
}

/// Retry attempts recorded across the concurrent requests of one run.
///
/// Cloning shares the underlying counter.
#[derive(Debug, Clone, Default)]
pub struct AttemptCounter(Arc<AtomicU32>);

impl AttemptCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one retry
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Retries recorded so far
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget runs out.
///
/// # Arguments
///
/// * `policy` - Backoff schedule
/// * `attempts` - Shared counter, incremented once per retry
/// * `what` - Label used in log lines
/// * `op` - Produces a fresh future for every attempt
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    attempts: &AttemptCounter,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let mut wait = policy.backoff(attempt);
                if let Some(suggested) = e.retry_after() {
                    if suggested > MAX_RETRY_AFTER {
                        warn!(
                            what = what,
                            suggested_secs = suggested.as_secs(),
                            max_secs = MAX_RETRY_AFTER.as_secs(),
                            "Retry-After too long, clamping"
                        );
                    }
                    wait = wait.max(suggested.min(MAX_RETRY_AFTER));
                }
                warn!(
                    what = what,
                    attempt = attempt + 1,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "Transient failure, backing off"
                );
                attempts.record();
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(what = what, attempt = attempt + 1, error = %e, "Giving up");
                return Err(e);
            }
        }
    }
}
