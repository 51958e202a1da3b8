//! Retry scheduling: backoff delay and next-eligible timestamp.
//!
//! Pure functions only. The policy reads its tunables from [`Config`] and holds
//! no other state.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Backoff delay in whole seconds: `backoff_base ^ attempts`.
///
/// `attempts` is the count *after* the failed attempt has been recorded, so the
/// first retry waits `backoff_base` seconds. Growth is unbounded; the result
/// saturates at `u64::MAX` instead of overflowing.
pub fn backoff_delay(attempts: u32, backoff_base: u32) -> u64 {
    u64::from(backoff_base).saturating_pow(attempts)
}

/// `now + delay_seconds`, clamped to the latest instant the fixed-width
/// timestamp encoding can represent.
pub fn next_retry_timestamp(now: DateTime<Utc>, delay_seconds: u64) -> DateTime<Utc> {
    let latest = latest_representable();
    let Ok(secs) = i64::try_from(delay_seconds) else {
        return latest;
    };
    Duration::try_seconds(secs)
        .and_then(|delay| now.checked_add_signed(delay))
        .map(|at| at.min(latest))
        .unwrap_or(latest)
}

fn latest_representable() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Retry policy derived from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Exponent base for the backoff delay.
    pub backoff_base: u32,
    /// Optional ceiling on a single delay, in seconds. `None` leaves growth
    /// unbounded.
    pub max_backoff_secs: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backoff_base: config.backoff_base,
            max_backoff_secs: config.max_backoff_secs,
        }
    }

    /// Delay before the next retry after `attempts` failed attempts.
    pub fn delay_for_attempt(&self, attempts: u32) -> u64 {
        let delay = backoff_delay(attempts, self.backoff_base);
        match self.max_backoff_secs {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// When a job that has failed `attempts` times becomes eligible again.
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        next_retry_timestamp(now, self.delay_for_attempt(attempts))
    }

    /// Whether a job with `attempts` recorded failures has used up its budget.
    pub fn is_exhausted(attempts: u32, max_retries: u32) -> bool {
        attempts >= max_retries
    }
}
