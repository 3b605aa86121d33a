//! Exponential backoff for reconnect scheduling
//!
//! Delay for attempt `n` (1-based) is `min(max_delay, initial_delay * multiplier^(n-1))`,
//! jittered uniformly by `±jitter_factor` and clamped to `[0, max_delay]`.

use crate::config::constants::*;
use crate::config::types::duration_ms;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first attempt
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for each attempt (typically 2.0)
    pub multiplier: f64,
    /// Uniform randomization around the base delay (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(BACKOFF_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(BACKOFF_MAX_DELAY_MS),
            multiplier: BACKOFF_MULTIPLIER,
            jitter_factor: BACKOFF_JITTER_FACTOR,
        }
    }
}

impl BackoffConfig {
    /// Create a configuration for aggressive retries (for testing)
    pub fn aggressive() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Create a configuration for conservative retries (for production)
    pub fn conservative() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// Deterministic configuration (no jitter)
    pub fn fixed_growth(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Un-jittered delay for a 1-based attempt number
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered delay for a 1-based attempt number
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();

        if self.jitter_factor <= 0.0 {
            return Duration::from_secs_f64(base);
        }

        let jitter = rng.gen_range(-self.jitter_factor..=self.jitter_factor);
        let jittered = (base * (1.0 + jitter))
            .max(0.0)
            .min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(jittered)
    }
}

/// Exponential backoff state machine
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    max_attempts: Option<u32>,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff with default configuration and no attempt limit
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default(), None)
    }

    /// Create a new backoff with custom configuration
    pub fn with_config(config: BackoffConfig, max_attempts: Option<u32>) -> Self {
        Self {
            config,
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Get the next delay duration and advance the attempt counter
    ///
    /// Returns None if max attempts exceeded
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }

        self.current_attempt += 1;
        Some(
            self.config
                .delay_for_attempt(self.current_attempt, &mut rand::thread_rng()),
        )
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt_number(&self) -> u32 {
        self.current_attempt
    }

    /// Check if more attempts are available
    pub fn can_retry(&self) -> bool {
        match self.max_attempts {
            Some(max) => self.current_attempt < max,
            None => true,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
