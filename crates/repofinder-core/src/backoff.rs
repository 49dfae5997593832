//! Retry policy shared by the model gateway and the hosting client.
//!
//! Every retry sleep in the crate happens inside [`BackoffPolicy::run`]; the
//! operations only decide whether an attempt should be retried and, when the
//! server says so, for how long to wait.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Outcome of a single attempt inside [`BackoffPolicy::run`].
#[derive(Debug)]
pub enum Step<T, E> {
    /// Stop retrying and return this result.
    Done(Result<T, E>),
    /// Retry after `wait`, or after the policy's exponential delay if `None`.
    /// If no attempts remain, `error` is returned.
    Retry { error: E, wait: Option<Duration> },
}

impl<T, E> Step<T, E> {
    pub fn retry(error: E) -> Self {
        Step::Retry { error, wait: None }
    }

    pub fn retry_after(error: E, wait: Duration) -> Self {
        Step::Retry {
            error,
            wait: Some(wait),
        }
    }
}

/// Exponential backoff: attempt `n` (0-based) waits `base_delay * 2^n`, plus
/// up to `jitter` of random slack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry that follows attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        let base = self.base_delay.saturating_mul(factor);
        if self.jitter.is_zero() {
            return base;
        }
        let slack = fastrand::u64(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(slack)
    }

    /// Run `op` until it yields [`Step::Done`] or attempts are exhausted.
    ///
    /// `op` receives the 0-based attempt number. No sleep follows the final
    /// attempt.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Step<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Step::Done(result) => return result,
                Step::Retry { error, wait } => {
                    if attempt + 1 >= attempts {
                        tracing::warn!(op = label, attempts, error = %error, "giving up");
                        return Err(error);
                    }
                    let wait = wait.unwrap_or_else(|| self.delay_for(attempt));
                    tracing::warn!(
                        op = label,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        wait_secs = wait.as_secs_f64(),
                        error = %error,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn delays_double() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_bounded() {
        let policy = BackoffPolicy::default().with_jitter(Duration::from_millis(250));
        for _ in 0..50 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_millis(2250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_first_try_no_sleep() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result: Result<u32, String> = BackoffPolicy::default()
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Step::Done(Ok(7)) }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_without_trailing_sleep() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result: Result<(), String> = BackoffPolicy::default()
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Step::retry("timeout".to_string()) }
            })
            .await;
        assert_eq!(result.unwrap_err(), "timeout");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first attempt, 2s after the second, nothing after the third.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn server_wait_overrides_policy() {
        let start = Instant::now();
        let result: Result<u32, String> = BackoffPolicy::default()
            .run("test", |attempt| async move {
                if attempt == 0 {
                    Step::retry_after("rate limited".to_string(), Duration::from_secs(65))
                } else {
                    Step::Done(Ok(attempt))
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(65));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = BackoffPolicy::default()
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Step::Done(Err("not found".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
