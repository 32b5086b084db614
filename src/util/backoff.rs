use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60 * 1_000;
/// Delays are jittered by up to half the current base in either direction.
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_ms: DEFAULT_MAX_DELAY_MILLIS,
        }
    }
}

/// Exponential backoff with jitter for reconnect attempts.
///
/// The first attempt after a [`reset`](Self::reset) is immediate. Every following attempt
/// multiplies the base delay by the backoff factor, clamped to
/// `[initial_delay_ms, max_delay_ms]`.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base_ms: f64,
    last_attempt_ms: Option<i64>,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Uses a caller-provided generator so jitter is reproducible.
    pub fn with_rng(config: BackoffConfig, rng: StdRng) -> Self {
        Self {
            config,
            current_base_ms: 0.0,
            last_attempt_ms: None,
            rng,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// The next attempt runs immediately.
    pub fn reset(&mut self) {
        self.current_base_ms = 0.0;
    }

    /// The next attempt waits the maximum delay, used after `ResourceExhausted`.
    pub fn reset_to_max(&mut self) {
        self.current_base_ms = self.config.max_delay_ms as f64;
    }

    /// Delay to wait before the next attempt; advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let now = chrono::Utc::now().timestamp_millis();
        let delay = self.next_delay_at(now);
        Duration::from_millis(delay)
    }

    fn next_delay_at(&mut self, now_ms: i64) -> u64 {
        let jitter = self.rng.gen_range(-RANDOM_FACTOR..=RANDOM_FACTOR) * self.current_base_ms;
        let delay_with_jitter = (self.current_base_ms + jitter).max(0.0);
        let since_last_attempt = self
            .last_attempt_ms
            .map(|last| (now_ms - last).max(0) as f64)
            .unwrap_or(0.0);
        let remaining = (delay_with_jitter - since_last_attempt).max(0.0);

        if self.current_base_ms > 0.0 {
            log::debug!(
                "backing off for {remaining:.0} ms (base delay {:.0} ms, delay with jitter {delay_with_jitter:.0} ms)",
                self.current_base_ms
            );
        }

        self.last_attempt_ms = Some(now_ms);
        self.current_base_ms = (self.current_base_ms * self.config.backoff_factor)
            .clamp(self.config.initial_delay_ms as f64, self.config.max_delay_ms as f64);
        remaining.round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::with_rng(BackoffConfig::default(), StdRng::seed_from_u64(42))
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = backoff();
        assert_eq!(backoff.next_delay_at(0), 0);
    }

    #[test]
    fn delays_grow_within_jitter_bounds() {
        let mut backoff = backoff();
        backoff.next_delay_at(0);
        let mut base = DEFAULT_INITIAL_DELAY_MILLIS as f64;
        for _ in 0..5 {
            let delay = backoff.next_delay_at(0) as f64;
            assert!(delay >= base * (1.0 - RANDOM_FACTOR) - 1.0, "{delay} below {base}");
            assert!(delay <= base * (1.0 + RANDOM_FACTOR) + 1.0, "{delay} above {base}");
            base = (base * DEFAULT_BACKOFF_FACTOR).min(DEFAULT_MAX_DELAY_MILLIS as f64);
        }
    }

    #[test]
    fn delay_is_capped_and_resettable() {
        let mut backoff = backoff();
        for _ in 0..40 {
            backoff.next_delay_at(0);
        }
        let capped = backoff.next_delay_at(0) as f64;
        assert!(capped <= DEFAULT_MAX_DELAY_MILLIS as f64 * (1.0 + RANDOM_FACTOR));

        backoff.reset();
        assert_eq!(backoff.next_delay_at(0), 0);

        backoff.reset_to_max();
        let after_max = backoff.next_delay_at(0) as f64;
        assert!(after_max >= DEFAULT_MAX_DELAY_MILLIS as f64 * (1.0 - RANDOM_FACTOR) - 1.0);
    }

    #[test]
    fn elapsed_time_counts_toward_the_delay() {
        let mut backoff = backoff();
        backoff.next_delay_at(0);
        assert_eq!(backoff.next_delay_at(10_000), 0);
    }
}
