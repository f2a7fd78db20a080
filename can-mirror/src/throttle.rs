//! Warning rate limiting for persistent per-event failures

use std::time::{Duration, Instant};

/// Lets one warning through per interval and counts the rest
#[derive(Debug)]
pub struct WarnThrottle {
    interval: Duration,
    last_emitted: Option<Instant>,
    suppressed: u64,
}

impl WarnThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: None,
            suppressed: 0,
        }
    }

    /// Returns the number of warnings suppressed since the last emitted one
    /// when a warning may be emitted now, `None` otherwise.
    pub fn admit(&mut self) -> Option<u64> {
        let now = Instant::now();
        let due = self
            .last_emitted
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            self.last_emitted = Some(now);
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppresses_within_interval() {
        let mut throttle = WarnThrottle::new(Duration::from_secs(3600));
        assert_eq!(throttle.admit(), Some(0));
        assert_eq!(throttle.admit(), None);
        assert_eq!(throttle.admit(), None);
        assert_eq!(throttle.suppressed, 2);
    }

    #[test]
    fn test_reports_suppressed_count() {
        let mut throttle = WarnThrottle::new(Duration::ZERO);
        throttle.suppressed = 5;
        throttle.last_emitted = Some(Instant::now());
        assert_eq!(throttle.admit(), Some(5));
        assert_eq!(throttle.admit(), Some(0));
    }
}
