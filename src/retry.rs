//! Bounded retry with exponential backoff and jitter.
//!
//! One policy object, one generic combinator. Generation and revision
//! both consume this instead of hand-rolling nested retry loops.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;

/// Retry policy: attempt cap, exponential backoff base, jitter bound.
///
/// With `fail_fast` set, exactly one attempt is made and the first error
/// is returned without sleeping.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: u64,
    pub jitter_max_ms: u64,
    pub fail_fast: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            backoff_base: 2,
            jitter_max_ms: 1000,
            fail_fast: false,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            backoff_base: cfg.backoff_base,
            jitter_max_ms: cfg.jitter_max_ms,
            fail_fast: cfg.fail_fast,
        }
    }
}

impl RetryPolicy {
    pub fn fail_fast() -> Self {
        Self {
            fail_fast: true,
            ..Default::default()
        }
    }

    /// Backoff before attempt `attempt` (1-based; no sleep before the
    /// first attempt). Exponential in the base, capped at 2^6 seconds,
    /// plus uniform jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = (attempt - 1).min(6);
        let secs = self.backoff_base.saturating_pow(exp);
        let jitter_ms = if self.jitter_max_ms > 0 {
            rand::thread_rng().gen_range(0..self.jitter_max_ms)
        } else {
            0
        };
        Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted.
    ///
    /// `label` only feeds the retry log line.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = if self.fail_fast { 1 } else { self.max_attempts };
        let mut last_err = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < attempts {
                        warn!(label, attempt, error = %e, "retrying after failure");
                    }
                    last_err = Some(e);
                }
            }
        }

        // attempts >= 1, so last_err is set by the time we get here
        Err(last_err.unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_try_without_sleeping() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_makes_exactly_one_attempt() {
        let policy = RetryPolicy::fail_fast();
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: 0,
            jitter_max_ms: 0,
            fail_fast: false,
        };
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = policy
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
