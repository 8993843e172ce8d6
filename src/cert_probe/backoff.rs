use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_JITTER: Duration = Duration::from_millis(100);

/// Exponential backoff with additive jitter.
///
/// The wait before retry `n` (0-based) is `base * 2^n` plus a random value in
/// `[0, jitter)`, so many endpoints failing at once against a shared network
/// path do not retry in lock step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base: DEFAULT_BACKOFF_BASE,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, base: Duration, jitter: Duration) -> Self {
        Self {
            max_retries,
            base,
            jitter,
        }
    }

    /// Deterministic part of the delay before retry `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.base_delay(attempt) + jitter
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Retry bookkeeping for one probe. Lives only as long as the probe does.
#[derive(Debug)]
pub struct RetryState {
    policy: BackoffPolicy,
    attempt: u32,
}

impl RetryState {
    /// Number of retries already granted.
    pub fn retries_used(&self) -> u32 {
        self.attempt
    }

    /// Attempts made so far, counting the first one.
    pub fn attempts_made(&self) -> u32 {
        self.attempt + 1
    }

    /// Records a failed attempt and returns how long to wait before the next
    /// one, or `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}
