//! Exponential backoff with optional jitter

use std::time::Duration;

use crate::config::RetrySettings;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            jitter,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.initial_backoff,
            settings.max_backoff,
            settings.backoff_multiplier,
            settings.jitter,
        )
    }

    /// Delay before retry number `attempt + 1`
    ///
    /// `initial * multiplier^attempt`, capped at `max`; with jitter the
    /// result is drawn uniformly from `[d/2, d]`.
    pub fn delay(&self, attempt: u32, rng: &mut fastrand::Rng) -> Duration {
        let exp = attempt.min(64) as i32;
        let secs = (self.initial.as_secs_f64() * self.multiplier.powi(exp)).min(self.max.as_secs_f64());
        let secs = if self.jitter {
            secs * (0.5 + rng.f64() * 0.5)
        } else {
            secs
        };
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_and_capped() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100), 2.0, false);
        let mut rng = fastrand::Rng::with_seed(0);
        let delays: Vec<u128> = (0..6).map(|a| backoff.delay(a, &mut rng).as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100, 100]);
        assert_eq!(backoff.delay(u32::MAX, &mut rng), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0, true);
        let mut rng = fastrand::Rng::with_seed(42);
        for attempt in 0..5 {
            let full = Duration::from_millis(100 * 2u64.pow(attempt)).min(Duration::from_secs(1));
            for _ in 0..50 {
                let d = backoff.delay(attempt, &mut rng);
                assert!(d >= full / 2 && d <= full, "{:?} outside [{:?}, {:?}]", d, full / 2, full);
            }
        }
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let backoff = Backoff::from_settings(&RetrySettings::default());
        let mut a = fastrand::Rng::with_seed(9);
        let mut b = fastrand::Rng::with_seed(9);
        for attempt in 0..8 {
            assert_eq!(backoff.delay(attempt, &mut a), backoff.delay(attempt, &mut b));
        }
    }
}
