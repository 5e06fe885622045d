//! Backoff and retry decisions for failed page fetches
//!
//! The policy is a pure value type: given the failure and how many attempts
//! have already been made, it either names a delay to wait before the next
//! attempt or gives up. The caller owns the actual sleeping, which keeps the
//! decision logic deterministic and testable.

use rand::Rng;
use std::time::Duration;

/// What to do after a failed fetch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait this long, then try again
    RetryAfter(Duration),
    /// The failure is permanent, stop trying
    Fail,
}

/// Retry policy with exponential backoff and jitter.
///
/// Classification:
///
/// | Failure | Action |
/// |---------|--------|
/// | HTTP 429 | Honor `Retry-After` if present, else back off |
/// | HTTP 5xx | Back off and retry |
/// | Transport error (timeout, connect) | Back off and retry |
/// | Any other 4xx | Fail immediately, never retry |
///
/// A non-429 4xx signals a defect in our request or configuration, not API
/// overload; repeating it would burn rate budget for the same answer.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide the fate of a failed attempt.
    ///
    /// # Arguments
    /// * `status` - HTTP status of the failure, or `None` for transport errors
    /// * `attempt` - 1-based count of attempts made so far
    /// * `retry_after` - upstream `Retry-After` hint, if any
    pub fn decide(
        &self,
        status: Option<u16>,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if let Some(code) = status
            && (400..500).contains(&code)
            && code != 429
        {
            return RetryDecision::Fail;
        }

        if attempt >= self.max_attempts {
            return RetryDecision::Fail;
        }

        let delay = match (status, retry_after) {
            (Some(429), Some(hint)) => hint.min(self.max_delay),
            _ => self.backoff(attempt),
        };

        RetryDecision::RetryAfter(delay)
    }

    /// Exponential backoff for the given attempt, with up to 25% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
        Duration::from_secs_f64(base.as_secs_f64() * jitter).min(self.max_delay)
    }
}
