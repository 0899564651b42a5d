//! Circuit breaker guarding the storage backend.
//!
//! The breaker stops the delivery worker from hammering a failing backend.
//! It tracks consecutive failed batches and temporarily skips delivery after a
//! threshold is reached; events stay buffered while the circuit is open.
//!
//! # States
//!
//! - **Closed**: Normal operation. Batches are delivered, failures are tracked.
//! - **Open**: After threshold failures, delivery is skipped.
//! - **Half-Open**: After the cool-down, a limited number of probe deliveries
//!   test recovery. The first success closes the circuit, any failure reopens it.
//!
//! The Open → Half-Open transition is evaluated lazily on the next
//! [`CircuitBreaker::allow`] call; no background timer is involved.
//!
//! # Usage
//!
//! ```rust,ignore
//! if breaker.allow() {
//!     match storage.write_batch(&batch).await {
//!         Ok(report) if report.is_complete() => breaker.record_success(),
//!         _ => breaker.record_failure(),
//!     }
//! }
//! ```

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{config::CircuitBreakerConfig, observability::metrics};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - deliveries pass through.
    Closed,
    /// Circuit tripped - deliveries are skipped.
    Open,
    /// Testing recovery - limited probe deliveries allowed.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct BreakerState {
    state: CircuitState,
    /// Consecutive failures while closed.
    failures: u32,
    /// When the circuit last opened.
    opened_at: Instant,
    /// Cool-down for the current open period (adaptive backoff).
    current_timeout: Duration,
    /// Number of times the circuit has opened without recovering in between.
    consecutive_opens: u32,
    /// Probe attempts allowed and not yet resolved while half-open.
    probes_in_flight: u32,
}

/// Thread-safe circuit breaker.
///
/// Mutated only by the delivery worker; producers never touch it.
pub struct CircuitBreaker {
    /// Backend name for logging and metrics.
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: config.clone(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: Instant::now(),
                current_timeout: config.calculate_open_timeout(0),
                consecutive_opens: 0,
                probes_in_flight: 0,
            }),
        }
    }

    /// Whether the next delivery attempt may proceed.
    ///
    /// Always true while closed. While open, false until the cool-down has
    /// elapsed, at which point the circuit moves to half-open and the caller
    /// holds the first probe. While half-open, at most `half_open_max_probes`
    /// unresolved attempts are allowed.
    pub fn allow(&self) -> bool {
        if !self.config.enabled {
            return true;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.opened_at.elapsed() >= inner.current_timeout {
                    self.transition_to_half_open(&mut inner);
                    inner.probes_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful delivery.
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                if inner.failures > 0 {
                    inner.failures = 0;
                    debug!(
                        backend = %self.name,
                        "Circuit breaker: failure counter reset after success"
                    );
                    metrics::record_circuit_breaker_failures(
                        &self.name,
                        0,
                        self.config.failure_threshold,
                    );
                }
            }
            CircuitState::HalfOpen => self.transition_to_closed(&mut inner),
            // A late result from before the circuit opened
            CircuitState::Open => {}
        }
    }

    /// Record a failed (or partially failed) delivery.
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.transition_to_open(&mut inner);
                } else {
                    debug!(
                        backend = %self.name,
                        failures = inner.failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker: failure recorded"
                    );
                    metrics::record_circuit_breaker_failures(
                        &self.name,
                        inner.failures,
                        self.config.failure_threshold,
                    );
                }
            }
            CircuitState::HalfOpen => self.transition_to_open(&mut inner),
            CircuitState::Open => {}
        }
    }

    /// Return a half-open permit obtained from [`allow`](Self::allow) that was
    /// not used for a delivery attempt (e.g. the buffer turned out to be empty).
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Get the current state of the circuit breaker.
    ///
    /// An open circuit whose cool-down has elapsed reports `HalfOpen`, since the
    /// next delivery attempt will be let through as a probe.
    pub fn state(&self) -> CircuitState {
        if !self.config.enabled {
            return CircuitState::Closed;
        }

        let inner = self.inner.lock();
        if inner.state == CircuitState::Open && inner.opened_at.elapsed() >= inner.current_timeout
        {
            return CircuitState::HalfOpen;
        }
        inner.state
    }

    /// Get the number of consecutive failures while closed.
    pub fn failure_count(&self) -> u32 {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Closed {
            inner.failures
        } else {
            0
        }
    }

    /// Get the number of consecutive opens without recovery.
    pub fn consecutive_opens(&self) -> u32 {
        self.inner.lock().consecutive_opens
    }

    /// Get the cool-down of the current (or next) open period.
    pub fn current_open_timeout(&self) -> Duration {
        self.inner.lock().current_timeout
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn transition_to_open(&self, inner: &mut BreakerState) {
        let consecutive = inner.consecutive_opens;
        inner.consecutive_opens += 1;
        inner.current_timeout = self.config.calculate_open_timeout(consecutive);
        inner.opened_at = Instant::now();
        inner.state = CircuitState::Open;
        inner.failures = 0;
        inner.probes_in_flight = 0;

        warn!(
            backend = %self.name,
            timeout_ms = inner.current_timeout.as_millis() as u64,
            consecutive_opens = consecutive + 1,
            base_timeout_ms = self.config.open_timeout_ms,
            "Circuit breaker OPENED - backend marked unhealthy"
        );
        metrics::record_circuit_breaker_state(&self.name, CircuitState::Open.as_str());
        metrics::record_circuit_breaker_consecutive_opens(&self.name, consecutive + 1);
        metrics::record_circuit_breaker_failures(&self.name, 0, self.config.failure_threshold);
    }

    fn transition_to_half_open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::HalfOpen;
        inner.probes_in_flight = 0;
        info!(
            backend = %self.name,
            "Circuit breaker HALF-OPEN - testing recovery"
        );
        metrics::record_circuit_breaker_state(&self.name, CircuitState::HalfOpen.as_str());
    }

    fn transition_to_closed(&self, inner: &mut BreakerState) {
        let previous_consecutive = inner.consecutive_opens;
        inner.consecutive_opens = 0;
        inner.current_timeout = self.config.calculate_open_timeout(0);
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.probes_in_flight = 0;

        info!(
            backend = %self.name,
            previous_consecutive_opens = previous_consecutive,
            "Circuit breaker CLOSED - backend recovered"
        );
        metrics::record_circuit_breaker_state(&self.name, CircuitState::Closed.as_str());
        metrics::record_circuit_breaker_consecutive_opens(&self.name, 0);
        metrics::record_circuit_breaker_failures(&self.name, 0, self.config.failure_threshold);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}
