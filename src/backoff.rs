use std::time::Duration;

use rand::Rng;

/// Exponential backoff used by the sender between transmission attempts.
///
/// The delay is `base_interval * factor^(attempt - 1)`, capped at `max_interval`,
/// with `jitter` spreading it over `[1 - jitter, 1 + jitter]`. The iterator ends
/// once `max_attempts` delays have been handed out.
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: Option<u16>,
    current_attempt: u16,
}

impl Exponential {
    /// `max_attempts: None` retries forever.
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter,
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Same as [`Exponential::new`] with the intervals given in milliseconds,
    /// the way [`crate::settings::RetrySettings`] stores them.
    pub fn from_millis(
        base_interval_ms: u32,
        max_interval_ms: u32,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_interval_ms as u64),
            Duration::from_millis(max_interval_ms as u64),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// Delays handed out so far.
    pub fn current_attempt(&self) -> u16 {
        self.current_attempt
    }

    fn calculate_delay(&self, attempt: u16) -> Duration {
        // attempt 0 would mean powi(-1)
        let attempt = attempt.max(1);
        let base_delay_ms =
            (self.base_interval.as_millis() as f64) * self.factor.powi((attempt - 1) as i32);

        if self.jitter == 0.0 {
            return Duration::from_millis(base_delay_ms as u64).min(self.max_interval);
        }

        let jitter_factor: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((base_delay_ms * jitter_factor) as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts {
            if self.current_attempt >= max_attempts {
                return None;
            }
        }

        self.current_attempt += 1;
        Some(self.calculate_delay(self.current_attempt))
    }
}
