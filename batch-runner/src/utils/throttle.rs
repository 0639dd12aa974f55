//! Rate limiting for raw progress samples.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Lets a progress sample through at most once per interval.
///
/// The final sample (`done >= total`) always passes.
pub struct ProgressThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    /// Whether a sample with this byte count should be published now.
    pub fn should_emit(&self, bytes_done: u64, bytes_total: u64) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        let finished = bytes_total > 0 && bytes_done >= bytes_total;
        let due = match *last {
            None => true,
            Some(at) => now.duration_since(at) >= self.interval,
        };
        if due || finished {
            *last = Some(now);
            true
        } else {
            false
        }
    }
}

/// Fraction of `done` over `total`, clamped to `[0, 1]`. Zero-sized totals count as complete.
pub fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_and_final_samples_pass() {
        let throttle = ProgressThrottle::new(Duration::from_secs(3600));
        assert!(throttle.should_emit(1, 100));
        assert!(!throttle.should_emit(2, 100));
        assert!(!throttle.should_emit(50, 100));
        assert!(throttle.should_emit(100, 100));
    }

    #[test]
    fn test_zero_interval_passes_everything() {
        let throttle = ProgressThrottle::new(Duration::ZERO);
        assert!(throttle.should_emit(1, 100));
        assert!(throttle.should_emit(2, 100));
    }

    #[test]
    fn test_fraction() {
        assert_eq!(fraction(0, 0), 1.0);
        assert_eq!(fraction(25, 100), 0.25);
        assert_eq!(fraction(200, 100), 1.0);
    }
}
