use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::warn;
use tokio::time::sleep;

use crate::config::RetryPolicy;

/// Bounded exponential-backoff wrapper around a single network call.
///
/// Attempt `n` that fails waits `base * 2^(n-1)` before attempt `n + 1`. The
/// last error is returned once the attempt bound is reached. Nothing is cached
/// here; callers own that.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryingRequestClient {
    policy: RetryPolicy,
}

impl RetryingRequestClient {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_with(operation, self.policy.max_attempts).await
    }

    pub async fn execute_with<T, E, F, Fut>(&self, mut operation: F, max_attempts: u32) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => {
                    warn!("Giving up after {} attempts: {}", attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!("Attempt {}/{} failed: {}; retrying in {:?}", attempt, max_attempts, e, delay);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.policy.base_delay.saturating_mul(1 << exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_exactly_max_attempts() {
        let client = RetryingRequestClient::default();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        let result: Result<(), String> = client
            .execute_with(
                || {
                    let calls = calls.clone();
                    async move {
                        let mut calls = calls.lock().unwrap();
                        calls.push(Instant::now());
                        Err(format!("failure {}", calls.len()))
                    }
                },
                3,
            )
            .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(1));
        assert_eq!(calls[2] - calls[1], Duration::from_secs(2));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failure_stops_retrying() {
        let client = RetryingRequestClient::default();
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<u32, String> = client
            .execute(|| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_calls_once() {
        let client = RetryingRequestClient::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = client
            .execute_with(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("down") }
                },
                0,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_doubles_from_base() {
        let client = RetryingRequestClient::new(RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        });
        assert_eq!(client.delay_for(1), Duration::from_millis(100));
        assert_eq!(client.delay_for(2), Duration::from_millis(200));
        assert_eq!(client.delay_for(4), Duration::from_millis(800));
    }
}
