use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60_000);
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffSettings {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter;
        self
    }
}

/// Exponential backoff with jitter.
///
/// The first call to [`ExponentialBackoff::next_delay`] returns zero. Each
/// later call grows the base delay by the factor, capped at the max delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
        }
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    /// Resets so the next attempt happens immediately.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Makes the next delay the maximum, used after `RESOURCE_EXHAUSTED`.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = jittered(self.current_base, self.settings.jitter_factor, rng);
        if !self.current_base.is_zero() {
            log::debug!(
                "Backing off for {} ms (base delay: {} ms)",
                delay.as_millis(),
                self.current_base.as_millis()
            );
        }

        let grown = self.current_base.as_secs_f64() * self.settings.backoff_factor;
        let grown = Duration::from_secs_f64(grown.max(self.settings.initial_delay.as_secs_f64()));
        self.current_base = grown.min(self.settings.max_delay);
        delay
    }
}

fn jittered<R: Rng + ?Sized>(base: Duration, jitter_factor: f64, rng: &mut R) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let base_millis = base.as_millis() as f64;
    let jitter = jitter_factor * base_millis * rng.gen_range(-1.0..=1.0);
    Duration::from_millis((base_millis + jitter).round().max(0.0) as u64)
}
