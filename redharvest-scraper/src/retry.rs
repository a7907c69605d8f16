//! Exponential-backoff retry for per-post and per-store operations.

use std::future::Future;
use std::time::Duration;

use redharvest_core::common::error::Result;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_factor: u64) -> Self {
        Self {
            max_retries,
            backoff_factor,
        }
    }

    /// Delay before retry `attempt` (1-based): factor^attempt seconds, so
    /// the default policy waits 2s, 4s, 8s.
    fn delay(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.backoff_factor.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 2)
    }
}

/// Run `op` until it succeeds, retrying retriable failures with
/// exponential backoff. Rate-limit rejections do not consume attempts; the
/// next call re-enters `await_capacity` and sleeps out the window there.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_rate_limited() => {
                warn!(op = op_name, "rate limited, retrying after reset");
                continue;
            }
            Err(e) if e.is_retriable() && attempt + 1 < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    max = policy.max_retries,
                    delay_secs = delay.as_secs(),
                    "attempt failed: {e}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(op = op_name, attempts = attempt + 1, "giving up: {e}");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redharvest_core::common::error::HarvestError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> HarvestError {
        HarvestError::Api {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryPolicy::default(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&RetryPolicy::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retriable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&RetryPolicy::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(HarvestError::NotFound("gone".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(HarvestError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_does_not_consume_attempts() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryPolicy::new(1, 2), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 | 1 => Err(HarvestError::RateLimited),
                    _ => Ok(n),
                }
            }
        })
        .await;
        // max_retries = 1 would have failed on the first real error, but
        // rate-limit rejections pass straight through.
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_are_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
    }
}
