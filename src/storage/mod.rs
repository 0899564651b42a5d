//! Storage backends for delivered usage events.
//!
//! The delivery worker and the client facade only talk to the
//! [`StorageGateway`] trait. Adapters:
//!
//! | Adapter | Feature | Notes |
//! |---|---|---|
//! | [`MemoryStorage`] | always | In-process; reference implementation and test double |
//! | `SqliteStorage` | `database-sqlite` | sqlx pool, SQL aggregation |
//! | `PostgresStorage` | `database-postgres` | sqlx pool, `JSONB` metadata, `date_trunc` buckets |
//! | `RedisStorage` | `redis` | Sorted sets scored by timestamp, in-process aggregation |
//!
//! Every adapter honours the same contract: writes are idempotent by event id,
//! query results are newest first by `(timestamp, id)`, `time_from` is inclusive
//! and `time_to` exclusive, and aggregate buckets are built through
//! [`AggregateBucket::from_totals`](crate::models::AggregateBucket::from_totals).

mod cursor;
mod memory;
#[cfg(feature = "database-postgres")]
mod postgres;
#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "database-sqlite")]
mod sqlite;
#[cfg(test)]
mod tests;
#[cfg(test)]
pub mod test_utils;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use cursor::{Cursor, CursorError};
pub use memory::MemoryStorage;
#[cfg(feature = "database-postgres")]
pub use postgres::PostgresStorage;
#[cfg(feature = "redis")]
pub use redis::RedisStorage;
#[cfg(feature = "database-sqlite")]
pub use sqlite::SqliteStorage;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    aggregation::GroupBy,
    config::BackendConfig,
    models::{AggregateBucket, UsageEvent, UsagePage, UsageQuery},
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid cursor: {0}")]
    InvalidCursor(#[from] CursorError),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    #[cfg(any(feature = "database-sqlite", feature = "database-postgres"))]
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[cfg(any(feature = "database-sqlite", feature = "database-postgres"))]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome of a `write_batch` call that reached the backend.
///
/// Backends that cannot store a batch atomically list the events they did not
/// store; the delivery worker requeues exactly those.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    failed: Vec<Uuid>,
}

impl WriteReport {
    /// Every event in the batch was stored.
    pub fn complete() -> Self {
        Self::default()
    }

    /// Only the events not listed in `failed` were stored.
    pub fn partial(failed: Vec<Uuid>) -> Self {
        Self { failed }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Ids of events the backend did not store.
    pub fn failed_ids(&self) -> &[Uuid] {
        &self.failed
    }
}

/// Contract every storage backend satisfies.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Short adapter name, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Durably store a batch.
    ///
    /// Either the whole batch is stored (`WriteReport::complete()`), some events
    /// are reported as not stored, or the call fails and none of it is treated
    /// as delivered. Re-writing an event with an id already stored is a no-op.
    async fn write_batch(&self, events: &[UsageEvent]) -> StorageResult<WriteReport>;

    /// One page of stored events matching the query, newest first.
    async fn query(&self, query: &UsageQuery) -> StorageResult<UsagePage>;

    /// Time-bucketed or per-dimension summary of stored events in `[from, to)`.
    async fn aggregate(
        &self,
        group_by: GroupBy,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<AggregateBucket>>;

    /// Whether the backend is reachable. Never fails.
    async fn health_check(&self) -> bool;

    /// Release connections. Called once by the delivery worker on shutdown.
    async fn close(&self) {}
}

/// Build the adapter selected by the configuration.
pub async fn connect(config: &BackendConfig) -> StorageResult<Arc<dyn StorageGateway>> {
    let storage: Arc<dyn StorageGateway> = match config {
        BackendConfig::Memory => Arc::new(MemoryStorage::new()),
        #[cfg(feature = "database-sqlite")]
        BackendConfig::Sqlite(cfg) => Arc::new(SqliteStorage::from_config(cfg).await?),
        #[cfg(feature = "database-postgres")]
        BackendConfig::Postgres(cfg) => Arc::new(PostgresStorage::from_config(cfg).await?),
        #[cfg(feature = "redis")]
        BackendConfig::Redis(cfg) => Arc::new(RedisStorage::from_config(cfg).await?),
    };

    tracing::info!(backend = storage.name(), "Storage backend connected");
    Ok(storage)
}
