use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Reconnect policy consumed by the connection lifecycle.
///
/// `next_delay` returning `None` means the attempt budget is spent and the channel should
/// degrade instead of retrying.
pub trait ReconnectStrategy: Send + Sync + 'static {
    fn next_delay(&mut self) -> Option<Duration>;
    fn reset(&mut self);
    fn attempts(&self) -> u32;
}

/// Capped exponential backoff with a bounded number of attempts.
///
/// Defaults: base 1s, factor 2, max delay 5s, 5 attempts, which yields
/// 1s, 2s, 4s, 5s, 5s and then gives up.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    base: Duration,
    max_delay: Duration,
    factor: f64,
    max_attempts: u32,
    jitter: bool,
    attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration, factor: f64, max_attempts: u32) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            2.0
        };
        Self {
            base,
            max_delay: max_delay.max(base),
            factor,
            max_attempts,
            jitter: false,
            attempts: 0,
        }
    }

    /// Randomize each delay into `[delay/2, delay]`.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt` (0-based), without jitter and without consuming budget.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let scaled = self.base.as_nanos() as f64 * self.factor.powi(attempt.min(64) as i32);
        let capped = scaled.min(self.max_delay.as_nanos() as f64).round();
        Some(Duration::from_nanos(capped.min(u64::MAX as f64) as u64))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5), 2.0, 5)
    }
}

impl ReconnectStrategy for BackoffPolicy {
    fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.delay_for(self.attempts)?;
        self.attempts = self.attempts.saturating_add(1);
        Some(if self.jitter {
            jitter_delay(delay)
        } else {
            delay
        })
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}

pub fn jitter_delay(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }

    let mut rng = SmallRng::from_entropy();
    let jitter: f64 = rng.gen_range(0.5..=1.0);
    let nanos = (base.as_nanos() as f64 * jitter) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_caps_and_exhausts() {
        let mut policy = BackoffPolicy::default();
        let delays: Vec<Duration> = std::iter::from_fn(|| policy.next_delay()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
        assert_eq!(policy.attempts(), 5);
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn reset_restores_full_budget() {
        let mut policy = BackoffPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            2.0,
            2,
        );
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(policy.next_delay(), None);

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn invalid_factor_falls_back_to_doubling() {
        let policy =
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60), f64::NAN, 3);
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(4)));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let mut policy = BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
            2.0,
            50,
        )
        .with_jitter(true);
        while let Some(delay) = policy.next_delay() {
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
        assert_eq!(jitter_delay(Duration::ZERO), Duration::ZERO);
    }
}
