//! Per-lane polling backoff.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff owned by a single polling lane.
///
/// `current` always stays within `[minimum, maximum]`.
#[derive(Debug, Clone)]
pub struct BackoffState {
    current: Duration,
    minimum: Duration,
    maximum: Duration,
    multiplier: f64,
}

impl BackoffState {
    pub fn new(config: &BackoffConfig) -> Self {
        let maximum = config.maximum.max(config.minimum);
        Self {
            current: config.minimum,
            minimum: config.minimum,
            maximum,
            multiplier: config.multiplier.max(1.0),
        }
    }

    /// Interval to sleep before the next poll.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn minimum(&self) -> Duration {
        self.minimum
    }

    pub fn maximum(&self) -> Duration {
        self.maximum
    }

    /// An empty poll (or a failed one): grow toward the maximum.
    pub fn record_empty(&mut self) {
        let next = self.current.mul_f64(self.multiplier);
        self.current = next.clamp(self.minimum, self.maximum);
    }

    /// New activity: back to the minimum.
    pub fn record_activity(&mut self) {
        self.current = self.minimum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(min: u64, max: u64, mult: f64) -> BackoffState {
        BackoffState::new(&BackoffConfig {
            minimum: Duration::from_secs(min),
            maximum: Duration::from_secs(max),
            multiplier: mult,
        })
    }

    #[test]
    fn empty_polls_double_then_clamp() {
        let mut b = state(60, 960, 2.0);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(b.current().as_secs());
            b.record_empty();
        }
        assert_eq!(seen, vec![60, 120, 240, 480, 960, 960]);

        b.record_activity();
        assert_eq!(b.current().as_secs(), 60);
    }

    #[test]
    fn reset_is_independent_of_streak_length() {
        for n in [0, 1, 3, 50] {
            let mut b = state(10, 300, 1.5);
            for _ in 0..n {
                b.record_empty();
            }
            b.record_activity();
            assert_eq!(b.current(), b.minimum());
        }
    }

    #[test]
    fn fractional_multiplier_stays_in_bounds() {
        let mut b = state(60, 480, 1.5);
        for _ in 0..20 {
            b.record_empty();
            assert!(b.current() >= b.minimum() && b.current() <= b.maximum());
        }
        assert_eq!(b.current(), b.maximum());
    }

    #[test]
    fn multiplier_of_one_is_constant() {
        let mut b = state(30, 300, 1.0);
        b.record_empty();
        b.record_empty();
        assert_eq!(b.current().as_secs(), 30);
    }
}
