//! Retry delay with exponential backoff and jitter

use serde::{Deserialize, Serialize};

/// Exponential backoff: `base * 2^(attempt-1)` capped at `max_delay_ms`,
/// then +/- `jitter_factor` uniform jitter, rounded to whole milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDelay {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0.0 - 1.0 share of the capped delay to randomize by
    pub jitter_factor: f64,
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 3_600_000, // 1 hour
            jitter_factor: 0.1,
        }
    }
}

impl RetryDelay {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, jitter_factor: f64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Delay before the given attempt (1-indexed)
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let exponential = (self.base_delay_ms as f64) * 2f64.powi(exponent as i32);
        let capped = exponential.min(self.max_delay_ms as f64);

        let jittered = if self.jitter_factor > 0.0 {
            use rand::Rng;
            let jitter_range = capped * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            capped + jitter
        } else {
            capped
        };

        jittered.round().max(0.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_each_attempt() {
        let delay = RetryDelay::new(1_000, 3_600_000, 0.0);
        assert_eq!(delay.delay_ms(1), 1_000);
        assert_eq!(delay.delay_ms(2), 2_000);
        assert_eq!(delay.delay_ms(3), 4_000);
        assert_eq!(delay.delay_ms(4), 8_000);
    }

    #[test]
    fn test_caps_at_max_delay() {
        let delay = RetryDelay::new(1_000, 10_000, 0.0);
        assert_eq!(delay.delay_ms(5), 10_000);
        assert_eq!(delay.delay_ms(30), 10_000);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let delay = RetryDelay::new(1_000, 3_600_000, 0.1);
        for attempt in 1..=10 {
            let base = RetryDelay::new(1_000, 3_600_000, 0.0).delay_ms(attempt);
            let jittered = delay.delay_ms(attempt);
            let band = (base as f64 * 0.1).ceil() as u64 + 1;
            assert!(
                jittered >= base.saturating_sub(band) && jittered <= base + band,
                "attempt {}: {} outside {}±{}",
                attempt,
                jittered,
                base,
                band
            );
        }
    }

    #[test]
    fn test_defaults() {
        let delay = RetryDelay::default();
        assert_eq!(delay.base_delay_ms, 1_000);
        assert_eq!(delay.max_delay_ms, 3_600_000);
        assert!((delay.jitter_factor - 0.1).abs() < f64::EPSILON);
    }
}
