//! Observability module providing logging and metrics.
//!
//! - Structured logging with configurable formats (pretty, compact, JSON),
//!   installed by [`init_tracing`] when the `tracing-init` feature is enabled
//! - Prometheus metrics recorded by the buffer, circuit breaker and delivery
//!   worker, exported when the `prometheus` feature is enabled

pub mod metrics;
#[cfg(feature = "tracing-init")]
mod tracing_init;

pub use metrics::{MetricsError, init_metrics};
#[cfg(feature = "tracing-init")]
pub use tracing_init::*;
