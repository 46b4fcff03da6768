//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

use palaver_types::config::ReconnectConfig;

/// Delay generator for broker reconnect attempts.
///
/// Each call to [`next_delay`](Backoff::next_delay) returns the current
/// delay (with jitter applied) and grows the base delay by `multiplier`, up
/// to `max`. [`reset`](Backoff::reset) returns to the initial delay after a
/// successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            current: initial,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.multiplier,
            config.jitter,
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let grown = base.as_secs_f64() * self.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.max.as_secs_f64()));

        if self.jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(base.as_secs_f64() * factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let mut b = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            2.0,
            0.0,
        );
        let delays: Vec<u128> = (0..5).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut b = Backoff::new(Duration::from_millis(50), Duration::from_secs(1), 2.0, 0.0);
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut b = Backoff::new(Duration::from_millis(1000), Duration::from_secs(60), 1.0, 0.2);
        for _ in 0..100 {
            let d = b.next_delay().as_millis();
            assert!((799..=1200).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn test_from_default_config() {
        let mut b = Backoff::from_config(&ReconnectConfig {
            jitter: 0.0,
            ..ReconnectConfig::default()
        });
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
    }
}
