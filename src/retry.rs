//! Bounded exponential backoff for external calls.

use std::future::Future;
use std::time::Duration;

use crate::common::with_timeout;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::errors::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total tries including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Minimum wait after a [`EngineError::RateLimited`].
    pub rate_limit_delay: Duration,
    /// Deadline on each individual try.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            base_delay: config.retry_base_backoff,
            max_delay: config.retry_max_backoff,
            rate_limit_delay: config.rate_limit_backoff,
            call_timeout: config.external_call_timeout,
        }
    }

    /// Delay before retry number `attempt` (0-indexed), without
    /// jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2f64.powi(attempt.min(30) as i32);
        let delay = self.base_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    fn delay_for(&self, err: &EngineError, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt);
        let base = match err {
            EngineError::RateLimited(_) => base.max(self.rate_limit_delay),
            _ => base,
        };
        // Up to 10% jitter so concurrent retries spread out.
        base + base.mul_f64(fastrand::f64() * 0.1)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts run out. The last error is returned.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let err = match with_timeout(operation, policy.call_timeout, f()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        attempt += 1;
        if !err.is_retryable() || attempt >= policy.attempts {
            if attempt > 1 {
                tracing::warn!("{operation} giving up after {attempt} attempts: {err}");
            }
            return Err(err);
        }
        let delay = policy.delay_for(&err, attempt - 1);
        tracing::debug!("{operation} attempt {attempt} failed, retrying in {delay:?}: {err}");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::errors::ErrorKind;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            rate_limit_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(350));
        assert_eq!(p.backoff_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn rate_limits_wait_longer() {
        let p = policy();
        let delay = p.delay_for(&EngineError::RateLimited("429".into()), 0);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(5500));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let res = retry(&policy(), "upload", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::TransientNetwork("reset".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(res, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = retry(&policy(), "upload", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::TransientNetwork("reset".into())) }
        })
        .await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::TransientNetwork);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn corruption_is_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = retry(&policy(), "download", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Corruption("digest".into())) }
        })
        .await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Corruption);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_calls_time_out() {
        let p = RetryPolicy {
            attempts: 1,
            ..policy()
        };
        let res: Result<()> = retry(&p, "provision", || async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Timeout);
    }
}
