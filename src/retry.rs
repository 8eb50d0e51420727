use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::Config;
use crate::error::Result;

/// Bounded exponential backoff shared by the fetch and notify paths:
/// base × 2^attempt, capped. One policy, two call sites.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.max_retries.max(1),
            base_delay_ms: cfg.retry_base_delay_ms,
            max_delay_ms: cfg.retry_max_delay_ms,
        }
    }

    /// Delay before retry number `attempt` (0-based). Shift is clamped so
    /// large attempt counts cannot overflow the multiplication.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Run `op` until it succeeds, fails terminally, or exhausts the policy.
/// Only errors classified transient (`AppError::is_transient`) are retried;
/// a credential rejection or data error surfaces on the first attempt.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{label} failed (attempt {}/{}): {e} — retrying in {}ms",
                    attempt + 1,
                    policy.max_attempts,
                    delay.as_millis(),
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.delay_for(0), Duration::from_millis(10));
        assert_eq!(p.delay_for(1), Duration::from_millis(20));
        assert_eq!(p.delay_for(2), Duration::from_millis(40));
        assert_eq!(p.delay_for(4), Duration::from_millis(100));
        assert_eq!(p.delay_for(30), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_is_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&policy(5), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::Delivery("channel unreachable".to_string()))
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
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&policy(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::Delivery("still down".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(AppError::Delivery(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_error_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&policy(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::Config("missing key".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
