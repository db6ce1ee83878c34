//! Truncated exponential backoff for reconnect attempts.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the base delay used as symmetric jitter (0.5 = ±50%).
    pub jitter: f64,
    /// A connection that stays up this long resets the backoff to minimum.
    pub healthy_window: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 1.3,
            jitter: 0.5,
            healthy_window: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct RetryHelper {
    config: RetryConfig,
    current_base: Duration,
}

impl RetryHelper {
    pub fn new(config: RetryConfig) -> Self {
        let current_base = config.min_delay;
        Self {
            config,
            current_base,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The delay to wait before the next attempt; grows the base for the
    /// attempt after.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base.as_secs_f64();
        let jitter = base * self.config.jitter * rng.gen_range(-1.0..=1.0);
        let delay = (base + jitter).max(0.0);

        let grown = base * self.config.multiplier;
        self.current_base = Duration::from_secs_f64(
            grown.min(self.config.max_delay.as_secs_f64()),
        );
        Duration::from_secs_f64(delay)
    }

    /// Feeds back how long the last connection survived.
    pub fn record_connection_uptime(&mut self, uptime: Duration) {
        if uptime >= self.config.healthy_window {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.current_base = self.config.min_delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn delays_grow_toward_the_cap() {
        let mut helper = RetryHelper::new(RetryConfig::default());
        let mut rng = StdRng::seed_from_u64(7);
        let mut last_base = Duration::ZERO;
        for _ in 0..24 {
            helper.next_delay_with_rng(&mut rng);
            assert!(helper.current_base >= last_base);
            last_base = helper.current_base;
        }
        assert_eq!(last_base, Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_half_the_base() {
        let config = RetryConfig::default();
        let mut helper = RetryHelper::new(config);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let base = helper.current_base.as_secs_f64();
            let delay = helper.next_delay_with_rng(&mut rng).as_secs_f64();
            assert!(delay >= base * 0.5 - f64::EPSILON);
            assert!(delay <= base * 1.5 + f64::EPSILON);
        }
    }

    #[test]
    fn healthy_connection_resets_backoff() {
        let mut helper = RetryHelper::new(RetryConfig::default());
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            helper.next_delay_with_rng(&mut rng);
        }
        assert!(helper.current_base > Duration::from_secs(1));

        helper.record_connection_uptime(Duration::from_secs(5));
        assert!(helper.current_base > Duration::from_secs(1));

        helper.record_connection_uptime(Duration::from_secs(31));
        assert_eq!(helper.current_base, Duration::from_secs(1));
    }
}
