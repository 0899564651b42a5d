use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Circuit breaker configuration for the storage backend.
///
/// The circuit breaker has three states:
/// - **Closed**: Normal operation, batches are delivered.
/// - **Open**: After threshold consecutive failures, delivery is skipped and
///   events stay buffered.
/// - **Half-Open**: After the cool-down, a limited number of probe deliveries
///   test recovery.
///
/// # Adaptive Backoff
///
/// When the backend keeps failing (circuit opens, probe fails, circuit reopens),
/// the cool-down can grow exponentially:
///
/// ```text
/// timeout = min(open_timeout_ms * backoff_multiplier^consecutive_opens, max_open_timeout_ms)
/// ```
///
/// The default multiplier of 1.0 keeps the cool-down fixed. The counter resets
/// when the circuit closes.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Whether the circuit breaker is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of consecutive failures that opens the circuit.
    #[serde(default = "default_failure_threshold")]
    #[validate(range(min = 1))]
    pub failure_threshold: u32,

    /// Base cool-down before a probe is allowed.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Number of concurrent probe attempts allowed while half-open.
    #[serde(default = "default_half_open_max_probes")]
    #[validate(range(min = 1))]
    pub half_open_max_probes: u32,

    /// Multiplier applied to the cool-down on every consecutive reopen.
    /// Set to 1.0 to disable adaptive backoff (fixed timeout).
    #[serde(default = "default_backoff_multiplier")]
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,

    /// Maximum cool-down after repeated failures.
    #[serde(default = "default_max_open_timeout_ms")]
    pub max_open_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
            backoff_multiplier: default_backoff_multiplier(),
            max_open_timeout_ms: default_max_open_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Calculate the cool-down for a given number of consecutive opens.
    ///
    /// Uses exponential backoff: `min(base * multiplier^consecutive_opens, max)`
    pub fn calculate_open_timeout(&self, consecutive_opens: u32) -> Duration {
        if consecutive_opens == 0 || self.backoff_multiplier <= 1.0 {
            return Duration::from_millis(self.open_timeout_ms);
        }

        let multiplied = (self.open_timeout_ms as f64)
            * self.backoff_multiplier.powi(consecutive_opens.min(64) as i32);
        let capped = (multiplied as u64)
            .min(self.max_open_timeout_ms)
            .max(self.open_timeout_ms);

        Duration::from_millis(capped)
    }
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_probes() -> u32 {
    1
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_max_open_timeout_ms() -> u64 {
    300_000 // 5 minutes
}
