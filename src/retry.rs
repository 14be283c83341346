//! Retry with exponential backoff for fallible async operations.
//!
//! Connecting to a scale that has just woken up fails routinely, so every
//! hardware-facing call site wraps itself in [`with_retry`] or, when only
//! some error kinds are worth repeating, [`with_conditional_retry`] with a
//! predicate such as [`crate::error::ScaleError::is_retryable`].

use std::future::Future;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Backoff settings for a retried operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. Must be >= 1.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to sleep after the given 1-based attempt fails.
    ///
    /// `delay(n) = min(base * multiplier^(n-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = (self.base_delay_ms as f64 * factor).round() as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Runs `op` until it succeeds or `config.max_attempts` is exhausted.
///
/// `on_retry` is invoked with `(attempt, error, delay)` before each sleep.
/// The error of the final attempt is propagated unchanged.
pub async fn with_retry<T, E, F, Fut, R>(op: F, on_retry: R, config: &RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(u32, &E, Duration),
{
    with_conditional_retry(op, |_| true, on_retry, config).await
}

/// Like [`with_retry`], but gives up immediately when `should_retry`
/// rejects the error.
pub async fn with_conditional_retry<T, E, F, Fut, P, R>(
    mut op: F,
    should_retry: P,
    mut on_retry: R,
    config: &RetryConfig,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    R: FnMut(u32, &E, Duration),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "Attempt {}/{} failed: {}. Retrying in {} ms",
                    attempt,
                    max_attempts,
                    err,
                    delay.as_millis()
                );
                on_retry(attempt, &err, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn delay_sequence_is_capped() {
        let cfg = RetryConfig {
            max_attempts: 5,
            ..config()
        };
        let delays: Vec<u64> = (1..=5)
            .map(|n| cfg.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));

        let calls_in_op = calls.clone();
        let retries_in_cb = retries.clone();
        let result: Result<u32, String> = with_retry(
            move || {
                let calls = calls_in_op.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 { Err(format!("failure {n}")) } else { Ok(42) }
                }
            },
            move |_, _, _| {
                retries_in_cb.fetch_add(1, Ordering::SeqCst);
            },
            &config(),
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn propagates_last_error_unwrapped() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();
        let result: Result<(), String> = with_retry(
            move || {
                let calls = calls_in_op.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {n}"))
                }
            },
            |_, _, _| {},
            &config(),
        )
        .await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_retry_stops_on_rejected_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();
        let result: Result<(), String> = with_conditional_retry(
            move || {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                }
            },
            |err: &String| err != "fatal",
            |_, _, _| {},
            &config(),
        )
        .await;

        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
