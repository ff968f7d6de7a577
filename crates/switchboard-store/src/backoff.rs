//! Jittered exponential backoff for reconnect loops.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with ±20% jitter, capped at `max`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl ExponentialBackoff {
    /// Backoff starting at `initial` and growing 1.5x per attempt up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 1.5,
            current: initial,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::rng().random_range(0.8..=1.2);
        self.next_delay_with(jitter)
    }

    /// [`next_delay`](Self::next_delay) with an explicit jitter factor,
    /// clamped to `[0.8, 1.2]`.
    pub fn next_delay_with(&mut self, jitter: f64) -> Duration {
        let base = self.current.as_secs_f64();
        let jitter = jitter.clamp(0.8, 1.2);
        let delay = Duration::from_secs_f64((base * jitter).min(self.max.as_secs_f64()));
        let next = base * self.multiplier;
        self.current = Duration::from_secs_f64(next.min(self.max.as_secs_f64()));
        delay
    }

    /// Restart the schedule after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_between_attempts() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let d1 = b.next_delay();
        let d2 = b.next_delay();
        assert!(d1.as_secs_f64() >= 0.8);
        assert!(d2.as_secs_f64() >= 1.5 * 0.8);
    }

    #[test]
    fn jitter_bounds_the_delay() {
        let mut low = ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60));
        let mut high = low.clone();
        assert!((low.next_delay_with(0.0).as_secs_f64() - 8.0).abs() < 1e-6);
        assert!((high.next_delay_with(5.0).as_secs_f64() - 12.0).abs() < 1e-6);
    }

    #[test]
    fn jitter_spreads_identical_schedules() {
        let delays: Vec<Duration> = (0..32)
            .map(|_| ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60)).next_delay())
            .collect();
        assert!(delays.iter().all(|d| (0.8..=1.2).contains(&d.as_secs_f64())));
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn caps_at_max() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        for _ in 0..50 {
            let _ = b.next_delay();
        }
        assert!(b.next_delay() <= Duration::from_secs(10));
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..20 {
            let _ = b.next_delay();
        }
        b.reset();
        assert!(b.next_delay() < Duration::from_secs(2));
    }
}
