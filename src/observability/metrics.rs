//! Prometheus metrics for the usage pipeline.
//!
//! Provides metrics for:
//! - Buffer depth and dropped events
//! - Batch deliveries (outcome, size, latency)
//! - Circuit breaker state and transitions
//!
//! Every `record_*` function is a no-op unless the `prometheus` feature is
//! enabled and a recorder has been installed.

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, gauge, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

/// Global Prometheus handle for rendering the scrape output.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &seconds_from_ms(&config.latency_buckets_ms),
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_batch_size".to_string()),
            &config.batch_size_buckets,
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    let handle = builder.install_recorder().map_err(MetricsError::Install)?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if config.enabled {
        tracing::warn!(
            "Metrics are enabled in config but the 'prometheus' feature is not compiled. \
            Rebuild with: cargo build --features prometheus"
        );
    }
    Ok(())
}

/// Convert millisecond buckets to seconds.
#[cfg(feature = "prometheus")]
fn seconds_from_ms(ms_buckets: &[f64]) -> Vec<f64> {
    ms_buckets.iter().map(|ms| ms / 1000.0).collect()
}

/// Get the Prometheus handle for rendering metrics.
#[cfg(feature = "prometheus")]
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record the number of events waiting in the buffer.
pub fn record_queue_depth(depth: usize) {
    #[cfg(feature = "prometheus")]
    gauge!("usage_buffer_queue_depth").set(depth as f64);
    #[cfg(not(feature = "prometheus"))]
    let _ = depth;
}

/// Record events discarded by the buffer or at shutdown.
///
/// `reason` is one of `overflow`, `requeue_overflow`, `shutdown`.
pub fn record_events_dropped(reason: &str, count: u64) {
    #[cfg(feature = "prometheus")]
    counter!("usage_events_dropped_total", "reason" => reason.to_string()).increment(count);
    #[cfg(not(feature = "prometheus"))]
    let _ = (reason, count);
}

/// Record one batch delivery attempt.
///
/// `outcome` is one of `success`, `partial`, `failure`, `timeout`.
pub fn record_batch_delivery(backend: &str, outcome: &str, size: usize, duration_secs: f64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("usage_batch_deliveries_total", "backend" => backend.to_string(), "outcome" => outcome.to_string())
            .increment(1);
        histogram!("usage_batch_delivery_duration_seconds", "backend" => backend.to_string(), "outcome" => outcome.to_string())
            .record(duration_secs);
        histogram!("usage_delivery_batch_size", "backend" => backend.to_string())
            .record(size as f64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (backend, outcome, size, duration_secs);
    }
}

/// Record events confirmed stored by the backend.
pub fn record_events_delivered(backend: &str, count: u64) {
    #[cfg(feature = "prometheus")]
    counter!("usage_events_delivered_total", "backend" => backend.to_string()).increment(count);
    #[cfg(not(feature = "prometheus"))]
    let _ = (backend, count);
}

/// Record circuit breaker state change.
///
/// Tracks both the current state as a gauge (0=closed, 1=open, 2=half_open)
/// and state transition events as counters.
pub fn record_circuit_breaker_state(breaker: &str, state: &str) {
    #[cfg(feature = "prometheus")]
    {
        let state_value = match state {
            "closed" => 0.0,
            "open" => 1.0,
            "half_open" => 2.0,
            _ => 0.0,
        };

        gauge!("usage_circuit_breaker_state", "breaker" => breaker.to_string()).set(state_value);

        counter!("usage_circuit_breaker_transitions_total", "breaker" => breaker.to_string(), "state" => state.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (breaker, state);
    }
}

/// Record circuit breaker failure count (for monitoring approach to threshold).
pub fn record_circuit_breaker_failures(breaker: &str, failure_count: u32, threshold: u32) {
    #[cfg(feature = "prometheus")]
    {
        gauge!("usage_circuit_breaker_failure_count", "breaker" => breaker.to_string())
            .set(failure_count as f64);

        let ratio = if threshold > 0 {
            failure_count as f64 / threshold as f64
        } else {
            0.0
        };
        gauge!("usage_circuit_breaker_failure_ratio", "breaker" => breaker.to_string())
            .set(ratio);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (breaker, failure_count, threshold);
    }
}

/// Record how many times the circuit has opened without recovering in between.
pub fn record_circuit_breaker_consecutive_opens(breaker: &str, consecutive_opens: u32) {
    #[cfg(feature = "prometheus")]
    gauge!("usage_circuit_breaker_consecutive_opens", "breaker" => breaker.to_string())
        .set(consecutive_opens as f64);
    #[cfg(not(feature = "prometheus"))]
    let _ = (breaker, consecutive_opens);
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_disabled_is_noop() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn test_record_functions_without_recorder() {
        // Without an installed recorder every call must be a silent no-op.
        record_queue_depth(3);
        record_events_dropped("overflow", 2);
        record_batch_delivery("memory", "success", 10, 0.01);
        record_events_delivered("memory", 10);
        record_circuit_breaker_state("memory", "open");
        record_circuit_breaker_failures("memory", 2, 5);
        record_circuit_breaker_consecutive_opens("memory", 1);
    }

    #[cfg(feature = "prometheus")]
    #[test]
    fn test_seconds_from_ms() {
        assert_eq!(seconds_from_ms(&[1.0, 250.0, 1000.0]), vec![0.001, 0.25, 1.0]);
    }
}
