//! Token-bucket admission control shared by every extraction task
//!
//! All network calls in the process funnel through one [`RateLimiter`], so the
//! aggregate request rate stays under the upstream ceiling no matter how many
//! endpoints are being harvested concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket that paces callers to a fraction of the documented API limit.
///
/// Tokens replenish continuously at `calls / period`, scaled down by a safety
/// margin so that clock skew between us and the upstream counter never trips
/// the real limit. Bucket capacity is held at a single token: a larger burst
/// allowance would let a cold start push up to twice the target rate through
/// one rolling window.
///
/// # Example
/// ```no_run
/// use rest_harvester::limiter::RateLimiter;
/// use std::time::Duration;
///
/// # async fn example() {
/// // 100 documented calls per minute, harvested at 80
/// let limiter = RateLimiter::new(100, Duration::from_secs(60), 0.2);
/// limiter.acquire().await;
/// // ... now safe to issue one request
/// # }
/// ```
pub struct RateLimiter {
    /// Tokens added per second
    refill_per_sec: f64,
    state: Mutex<BucketState>,
    issued: AtomicU64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter for `calls` per `period`, reduced by `safety_margin`.
    ///
    /// A margin of `0.2` against a documented 100 calls/minute yields an
    /// effective budget of 80 calls/minute. The margin is clamped to `[0, 0.9]`
    /// and the effective rate is floored at one call per period.
    pub fn new(calls: u32, period: Duration, safety_margin: f64) -> Self {
        let margin = safety_margin.clamp(0.0, 0.9);
        let effective = (calls as f64 * (1.0 - margin)).max(1.0);
        let refill_per_sec = effective / period.as_secs_f64().max(f64::EPSILON);

        log::debug!(
            "Rate limiter: {} calls per {:?} (margin {:.0}%) -> {:.3} calls/sec",
            calls,
            period,
            margin * 100.0,
            refill_per_sec
        );

        Self {
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
            issued: AtomicU64::new(0),
        }
    }

    /// Convenience constructor returning a shared handle.
    pub fn shared(calls: u32, period: Duration, safety_margin: f64) -> Arc<Self> {
        Arc::new(Self::new(calls, period, safety_margin))
    }

    /// Suspend the caller until a token is available, then consume it.
    ///
    /// Safe to call from any number of concurrent tasks. Waiters that wake
    /// re-compete for the bucket, so no caller can be starved past one refill
    /// interval per competitor ahead of it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill);
                state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(1.0);
                state.last_refill = now;

                // The epsilon absorbs float rounding from repeated refills
                if state.tokens >= 1.0 - 1e-9 {
                    state.tokens = (state.tokens - 1.0).max(0.0);
                    self.issued.fetch_add(1, Ordering::Relaxed);
                    return;
                }

                // Floor the wait so rounding can never produce a zero-length
                // sleep and a busy loop
                let seconds = ((1.0 - state.tokens) / self.refill_per_sec).max(0.001);
                Duration::from_secs_f64(seconds)
            };

            log::trace!("Rate limiter saturated, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Total number of tokens handed out since construction.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Minimum spacing between consecutive tokens.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refill_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_token_is_immediate() {
        let limiter = RateLimiter::new(60, Duration::from_secs(60), 0.0);
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.issued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_are_spaced_by_refill_interval() {
        // 4 calls/sec effective -> 250ms spacing
        let limiter = RateLimiter::new(5, Duration::from_secs(1), 0.2);
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        // two waits of ~250ms after the free first token
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(499), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(510), "elapsed {:?}", elapsed);
        assert_eq!(limiter.issued(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquires_respect_rolling_window() {
        // 8 effective calls per second
        let limiter = RateLimiter::shared(10, Duration::from_secs(1), 0.2);
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..20 {
            let limiter = limiter.clone();
            tasks.spawn(async move {
                limiter.acquire().await;
                Instant::now()
            });
        }

        let mut stamps = Vec::new();
        while let Some(stamp) = tasks.join_next().await {
            stamps.push(stamp.unwrap());
        }
        stamps.sort();

        // Consecutive grants are spaced by at least the refill interval, so
        // no rolling 1-second window sees more than the 8 budgeted calls.
        for pair in stamps.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(124), "grants {:?} apart", gap);
        }
        assert_eq!(limiter.issued(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_bucket_does_not_accumulate_burst() {
        let limiter = RateLimiter::new(10, Duration::from_secs(1), 0.0);
        limiter.acquire().await;

        // A long idle period must not bank more than one token
        tokio::time::sleep(Duration::from_secs(30)).await;

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(99), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(110), "elapsed {:?}", elapsed);
    }
}
