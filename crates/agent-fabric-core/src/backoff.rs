//! Exponential backoff with jitter for reconnect loops.

use agent_fabric_config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Produces successive reconnect delays until the attempt budget runs out.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    /// Attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }

        let base = self.initial.as_millis() as f64 * self.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.max.as_millis() as f64);
        self.attempt += 1;

        let spread = capped * self.jitter;
        let delay = if spread > 0.0 {
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Some(Duration::from_millis(delay.round() as u64))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
