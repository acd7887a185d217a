use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive random jitter, clamped to a cap.
///
/// delay = min(cap, base * 2^attempt + jitter), jitter in [0, jitter_max)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub jitter_max: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            jitter_max: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, jitter_max: Duration, cap: Duration) -> Self {
        Self {
            base,
            jitter_max,
            cap,
        }
    }

    /// Base taken from the scheduler's inter-batch delay.
    pub fn from_batch_delay(inter_batch: Duration, jitter_max: Duration, cap: Duration) -> Self {
        Self::new(inter_batch, jitter_max, cap)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter_max.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.delay_with_jitter(attempt, jitter)
    }

    /// Deterministic form of [`next_delay`](Self::next_delay).
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .saturating_mul(factor)
            .saturating_add(jitter)
            .min(self.cap)
    }
}
