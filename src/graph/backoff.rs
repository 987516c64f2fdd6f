//! Retry delay computation.
//!
//! The policy is a pure function of the attempt number and an optional
//! server-supplied wait hint. Randomness is injected so callers that need
//! reproducible delays can pass a seeded RNG.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Default base delay for the first retry.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Default ceiling applied to computed delays.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Exponential backoff with additive jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry, also the width of the jitter window.
    pub base: Duration,
    /// Upper bound for computed delays.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max_delay: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    /// Delay before retry number `attempt` (1-based), using the thread RNG.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        self.delay_with_rng(attempt, hint, &mut rand::rng())
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// A server hint wins outright. Otherwise the delay is
    /// `base * 2^(attempt-1)` plus jitter drawn from `[0, base)`, clamped to
    /// `max_delay`.
    pub fn delay_with_rng<R: Rng>(
        &self,
        attempt: u32,
        hint: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }

        let exp = attempt.saturating_sub(1).min(31);
        let backoff = self.base.saturating_mul(1u32 << exp);
        let window = u64::try_from(self.base.as_nanos()).unwrap_or(u64::MAX);
        let jitter = if window == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(rng.random_range(0..window))
        };

        backoff.saturating_add(jitter).min(self.max_delay)
    }
}

/// Parse a `Retry-After` header value.
///
/// Accepts delta-seconds (integer or fractional) and HTTP dates. Negative,
/// non-finite, or unparseable values yield `None`; dates in the past yield
/// a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
