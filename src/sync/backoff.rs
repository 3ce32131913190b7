use rand::Rng;
use std::time::Duration;

/// Exponential backoff for consecutive upstream failures.
///
/// The n-th consecutive failure waits a random delay between the (n-1)-th
/// and n-th ceilings, where ceiling(n) = `base * 2^(n-1)` capped at `max`.
/// Delays are therefore non-decreasing and never exceed `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    /// Consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    #[allow(dead_code)]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Upper bound of the delay after `failures` consecutive failures.
    pub fn ceiling(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = failures.saturating_sub(1).min(62) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exp);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let hi = self.ceiling(self.failures);
        let lo = if self.failures == 1 {
            hi / 2
        } else {
            self.ceiling(self.failures - 1)
        };
        let lo_ms = lo.as_millis() as u64;
        let hi_ms = (hi.as_millis() as u64).max(lo_ms);
        Duration::from_millis(rand::thread_rng().gen_range(lo_ms..=hi_ms))
    }

    /// Forget past failures after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// `delay` plus up to `max_jitter` of random extra wait.
pub fn jittered(delay: Duration, max_jitter: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..=max_jitter.as_millis() as u64);
    delay + Duration::from_millis(extra)
}
