//! Rate limiting for the hosting API.
//!
//! One [`HostingRateLimiter`] is owned by the process and shared by every
//! worker. It spaces requests with an adaptive governor quota and holds a
//! "blocked until" gate: when the API reports its budget exhausted, the first
//! worker to notice computes the reset wait and every other worker waits on
//! the same deadline instead of querying `/rate_limit` again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Extra seconds added on top of any server-declared wait.
pub const RATE_LIMIT_MARGIN_SECS: u64 = 5;
/// Wait used when the reset time is unknown, and the floor for computed waits.
pub const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 60;

const MAX_SLOWDOWN: u32 = 16;
const SLOWDOWN_COOLDOWN: Duration = Duration::from_secs(60);

/// Remaining request budget as reported by the hosting API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateStatus {
    pub limit: u64,
    pub remaining: u64,
    /// Unix epoch seconds at which the budget resets.
    pub reset: u64,
}

pub struct HostingRateLimiter {
    limiter: ArcSwap<DirectLimiter>,
    base_period: Duration,
    /// Multiplier on `base_period`, a power of two up to `MAX_SLOWDOWN`.
    current_factor: AtomicU32,
    last_limited: std::sync::Mutex<Option<Instant>>,
    blocked_until: std::sync::Mutex<Option<tokio::time::Instant>>,
    /// Held while a worker computes a rate-limit wait.
    gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for HostingRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostingRateLimiter")
            .field("base_period", &self.base_period)
            .field("current_factor", &self.current_factor.load(Ordering::SeqCst))
            .finish()
    }
}

fn direct(period: Duration) -> Arc<DirectLimiter> {
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(std::num::NonZeroU32::MIN));
    Arc::new(DirectLimiter::direct(quota))
}

impl HostingRateLimiter {
    /// A limiter allowing one request per `period`. A zero period is treated
    /// as one request per second.
    pub fn new(period: Duration) -> Self {
        Self {
            limiter: ArcSwap::from(direct(period)),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_limited: std::sync::Mutex::new(None),
            blocked_until: std::sync::Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Shared handle, as passed to every client.
    pub fn shared(period: Duration) -> Arc<Self> {
        Arc::new(Self::new(period))
    }

    /// Wait for any active block to pass, then for a governor permit.
    pub async fn acquire(&self) {
        if let Some(remaining) = self.blocked_remaining() {
            tracing::debug!(wait_secs = remaining.as_secs_f64(), "waiting on hosting rate-limit gate");
            tokio::time::sleep(remaining).await;
        }
        self.try_decay();
        let limiter = self.limiter.load();
        limiter.until_ready().await;
    }

    /// Halve the request rate after the API reports its hourly budget
    /// spent, down to one sixteenth of the configured rate.
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_limited.lock() {
            *last = Some(Instant::now());
        }
        let previous = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                (f < MAX_SLOWDOWN).then_some(f * 2)
            });
        if let Ok(previous) = previous {
            self.install(previous * 2);
        }
    }

    /// Block every caller of [`acquire`](Self::acquire) for `wait`. An
    /// existing later deadline is kept.
    pub fn block_for(&self, wait: Duration) {
        let until = tokio::time::Instant::now() + wait;
        if let Ok(mut blocked) = self.blocked_until.lock() {
            match *blocked {
                Some(existing) if existing >= until => {}
                _ => *blocked = Some(until),
            }
        }
    }

    /// Time left on the current block, if any.
    pub fn blocked_remaining(&self) -> Option<Duration> {
        let blocked = self.blocked_until.lock().ok()?;
        let until = (*blocked)?;
        let now = tokio::time::Instant::now();
        (until > now).then(|| until - now)
    }

    /// Serialize rate-limit handling across workers.
    pub async fn lock_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub fn current_factor(&self) -> u32 {
        self.current_factor.load(Ordering::SeqCst)
    }

    /// Go back to the configured rate once no rate-limit reply has been
    /// seen for [`SLOWDOWN_COOLDOWN`].
    fn try_decay(&self) {
        let cooled = match self.last_limited.lock() {
            Ok(last) => last.is_some_and(|t| t.elapsed() >= SLOWDOWN_COOLDOWN),
            Err(_) => false,
        };
        if cooled && self.current_factor.swap(1, Ordering::SeqCst) > 1 {
            self.install(1);
        }
    }

    fn install(&self, factor: u32) {
        let period = self.base_period.saturating_mul(factor);
        self.limiter.store(direct(period));
    }
}

/// Wait declared by a `Retry-After` header: delta seconds, or an HTTP date
/// measured from now. A date in the past means no wait.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    retry_after_at(value, Utc::now())
}

fn retry_after_at(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some((at.with_timezone(&Utc) - now).to_std().unwrap_or(Duration::ZERO))
}

/// How long to wait after a rate-limit response.
///
/// - A declared `Retry-After` wins: that value plus the margin.
/// - Otherwise, if the status shows the budget exhausted with a known reset,
///   wait until the reset plus the margin, but never less than 60s.
/// - Otherwise 60s.
pub fn rate_limit_wait(
    retry_after: Option<Duration>,
    status: Option<RateStatus>,
    now_epoch_secs: u64,
) -> Duration {
    let margin = Duration::from_secs(RATE_LIMIT_MARGIN_SECS);
    if let Some(declared) = retry_after {
        return declared + margin;
    }
    let floor = DEFAULT_RATE_LIMIT_WAIT_SECS;
    match status {
        Some(s) if s.remaining == 0 && s.reset > 0 => {
            let until_reset = s.reset.saturating_sub(now_epoch_secs) + RATE_LIMIT_MARGIN_SECS;
            Duration::from_secs(until_reset.max(floor))
        }
        _ => Duration::from_secs(floor),
    }
}

/// Whether a response signals an exhausted request budget: 429, or 403 whose
/// body mentions the rate limit.
pub fn is_rate_limited(status: u16, body: &str) -> bool {
    status == 429 || (status == 403 && body.to_lowercase().contains("rate limit"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_integer_seconds() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
    }

    #[test]
    fn http_date_measured_from_now() {
        let now = DateTime::parse_from_rfc3339("2015-10-21T07:27:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let val = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(retry_after_at(val, now), Some(Duration::from_secs(60)));
        // Already passed
        let later = now + chrono::Duration::hours(1);
        assert_eq!(retry_after_at(val, later), Some(Duration::ZERO));
    }

    #[test]
    fn parse_garbage_none() {
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("Wed, 99 Foo"), None);
    }

    #[test]
    fn wait_prefers_retry_after() {
        let wait = rate_limit_wait(Some(Duration::from_secs(10)), None, 0);
        assert_eq!(wait, Duration::from_secs(15));
    }

    #[test]
    fn wait_until_reset_with_floor() {
        let status = RateStatus {
            limit: 60,
            remaining: 0,
            reset: 1_000_300,
        };
        assert_eq!(
            rate_limit_wait(None, Some(status), 1_000_000),
            Duration::from_secs(305)
        );
        // Reset already close: the 60s floor applies.
        assert_eq!(
            rate_limit_wait(None, Some(status), 1_000_290),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn wait_default_when_budget_left_or_unknown() {
        let status = RateStatus {
            limit: 60,
            remaining: 12,
            reset: 1_000_300,
        };
        assert_eq!(
            rate_limit_wait(None, Some(status), 1_000_000),
            Duration::from_secs(60)
        );
        assert_eq!(rate_limit_wait(None, None, 1_000_000), Duration::from_secs(60));
    }

    #[test]
    fn rate_limit_detection() {
        assert!(is_rate_limited(429, ""));
        assert!(is_rate_limited(403, r#"{"message":"API rate limit exceeded for 1.2.3.4"}"#));
        assert!(!is_rate_limited(403, r#"{"message":"Resource not accessible"}"#));
        assert!(!is_rate_limited(200, "rate limit"));
    }

    #[test]
    fn on_rate_limited_doubles_and_caps() {
        let limiter = HostingRateLimiter::new(Duration::from_millis(100));
        assert_eq!(limiter.current_factor(), 1);
        limiter.on_rate_limited();
        assert_eq!(limiter.current_factor(), 2);
        for _ in 0..10 {
            limiter.on_rate_limited();
        }
        assert_eq!(limiter.current_factor(), 16);
    }

    #[tokio::test]
    async fn decay_restores_after_60s() {
        let limiter = HostingRateLimiter::new(Duration::from_millis(1));
        limiter.on_rate_limited();
        limiter.on_rate_limited();
        assert_eq!(limiter.current_factor(), 4);

        {
            let mut last = limiter.last_limited.lock().unwrap();
            *last = Some(Instant::now() - Duration::from_secs(61));
        }

        limiter.acquire().await;
        assert_eq!(limiter.current_factor(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn block_keeps_later_deadline() {
        let limiter = HostingRateLimiter::new(Duration::from_millis(1));
        assert!(limiter.blocked_remaining().is_none());

        limiter.block_for(Duration::from_secs(60));
        limiter.block_for(Duration::from_secs(10));
        let remaining = limiter.blocked_remaining().unwrap();
        assert_eq!(remaining, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.blocked_remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_out_block() {
        let limiter = HostingRateLimiter::new(Duration::from_millis(1));
        limiter.block_for(Duration::from_secs(30));
        let start = tokio::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
