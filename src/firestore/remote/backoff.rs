use std::time::Duration;

use rand::Rng;

/// Reconnect policy shared by the listen and write streams.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySettings {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Each delay is randomized by up to this fraction of the current base, either way.
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
        }
    }
}

/// Exponential backoff with jitter. The first attempt after a reset is immediate.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    settings: RetrySettings,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
        }
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// The next delay will be the maximum, e.g. after the backend reported exhaustion.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    /// Delay to wait before the next attempt; advances the base for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jittered(self.current_base);
        if !self.current_base.is_zero() {
            log::debug!(
                "Backing off for {} ms (base delay: {} ms)",
                delay.as_millis(),
                self.current_base.as_millis()
            );
        }

        let next_base = self.current_base.mul_f64(self.settings.multiplier);
        self.current_base = next_base
            .max(self.settings.initial_delay)
            .min(self.settings.max_delay);
        delay
    }

    fn jittered(&self, base: Duration) -> Duration {
        if base.is_zero() || self.settings.jitter_factor <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-1.0..=1.0) * self.settings.jitter_factor;
        let millis = base.as_secs_f64() * 1000.0 * (1.0 + spread);
        Duration::from_secs_f64(millis.max(0.0) / 1000.0)
    }
}
