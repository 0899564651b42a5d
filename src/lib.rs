//! Client-side token usage telemetry for LLM applications.
//!
//! Applications record one usage event per model request through a
//! [`UsageClient`]. Events are validated and buffered in memory without I/O,
//! then delivered in batches to a storage backend by a background worker
//! guarded by a circuit breaker. Stored events can be paged through with
//! [`UsageClient::query`] and summarized with [`UsageClient::aggregate`].
//!
//! Backends are selected by cargo feature:
//! - `database-sqlite` (default): SQLite via sqlx
//! - `database-postgres`: PostgreSQL via sqlx
//! - `redis`: Redis sorted sets
//!
//! An in-memory backend is always available.

pub mod aggregation;
pub mod buffer;
pub mod circuit_breaker;
mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod models;
pub mod observability;
pub mod storage;

#[cfg(test)]
mod tests;

pub use aggregation::GroupBy;
pub use circuit_breaker::CircuitState;
pub use client::{ClientStats, UsageClient};
pub use config::{OverflowPolicy, Settings};
pub use error::{UsageError, UsageResult, ValidationError};
pub use models::{
    AggregateBucket, Metadata, MetadataValue, NewUsageEvent, UsageEvent, UsagePage, UsageQuery,
};
pub use storage::{StorageError, StorageGateway};
