//! Jittered exponential backoff for the worker loop.

use rand::Rng;
use std::time::Duration;

/// Doubling delay between `initial` and `max`, with +/-25% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now; doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let secs = base.as_secs_f64();
        let jittered = random_between(
            Duration::from_secs_f64(secs * 0.75),
            Duration::from_secs_f64(secs * 1.25),
        );
        jittered.min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Uniform duration in `[min, max]`.
pub fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let secs = rand::thread_rng().gen_range(min.as_secs_f64()..=max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_delay()).collect();

        assert!(delays[0] >= Duration::from_millis(750));
        assert!(delays[0] <= Duration::from_millis(1250));
        assert!(delays[2] >= Duration::from_secs(3));
        for d in &delays {
            assert!(*d <= Duration::from_secs(8));
        }
        assert!(delays[5] >= Duration::from_secs(6));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(2500));
    }

    #[test]
    fn test_random_between() {
        let min = Duration::from_secs(60);
        let max = Duration::from_secs(300);
        for _ in 0..100 {
            let d = random_between(min, max);
            assert!(d >= min && d <= max);
        }
        assert_eq!(random_between(max, min), max);
    }
}
