//! Bounded retry with exponential backoff and jitter.
//!
//! Cluster writes race with controllers that bump `resourceVersion` behind our
//! back. Callers pick which failures are worth another attempt with a
//! predicate; everything else is returned on the first failure.
//!
//! ```ignore
//! use llmops_common::retry::{retry_if, RetryPolicy};
//!
//! let patched = retry_if(
//!     &RetryPolicy::conflict(),
//!     "scale backing deployment",
//!     |e: &Error| e.is_conflict(),
//!     || async { cluster.patch(kind, name, ns, body.clone()).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff parameters for a retried operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first one; always at least 1
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every failure
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed attempt budget and default timings
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Short backoff used for `resourceVersion` conflicts on patch
    pub fn conflict() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects the error, or the
/// attempt budget is spent. The last error is returned unchanged.
pub async fn retry_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            debug!(operation = %operation_name, error = %e, "error is not retryable");
            return Err(e);
        }
        if attempt >= max_attempts {
            warn!(
                operation = %operation_name,
                attempt,
                error = %e,
                "giving up after max attempts"
            );
            return Err(e);
        }

        // 0.5x to 1.5x so concurrent writers spread out
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = jittered.as_millis() as u64,
            "operation failed, retrying"
        );

        tokio::time::sleep(jittered).await;
        delay = policy.next_delay(delay);
    }
}
