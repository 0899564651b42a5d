use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use uuid::Uuid;

use super::{StorageError, StorageGateway, StorageResult, WriteReport, cursor};
use crate::{
    aggregation::{BucketKey, BucketTotals, GroupBy, buckets_from_totals},
    config::SqliteConfig,
    models::{AggregateBucket, Metadata, UsageEvent, UsagePage, UsageQuery},
};

/// SQLite has a limit of 999 parameters per query (SQLITE_LIMIT_VARIABLE_NUMBER).
/// Each event uses 7 parameters.
const MAX_EVENTS_PER_STATEMENT: usize = 100;

const SELECT_COLUMNS: &str = "id, project_name, request_type, input_tokens, output_tokens, metadata, recorded_at";

/// Storage adapter backed by a SQLite database.
///
/// Timestamps are stored as Unix milliseconds, metadata as a JSON object.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the pool described by `config`, running migrations if enabled.
    pub async fn from_config(config: &SqliteConfig) -> StorageResult<Self> {
        let in_memory = config.is_in_memory();

        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.path)
                .create_if_missing(config.create_if_missing)
                .journal_mode(if config.wal_mode {
                    SqliteJournalMode::Wal
                } else {
                    SqliteJournalMode::Delete
                })
        };
        let options = options.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms));

        // Each connection to `:memory:` opens its own database; keep exactly one
        // alive for the lifetime of the pool.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = pool_options.connect_with(options).await?;

        if config.run_migrations {
            Self::run_migrations(&pool).await?;
        }

        tracing::debug!(path = %config.path, "SQLite storage opened");
        Ok(Self::new(pool))
    }

    /// Run SQLite migrations using sqlx's migration runner.
    pub async fn run_migrations(pool: &SqlitePool) -> StorageResult<()> {
        tracing::info!("Running SQLite migrations");
        sqlx::migrate!("./migrations_sqlx/sqlite").run(pool).await?;
        tracing::info!("SQLite migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_event(row: &SqliteRow) -> StorageResult<UsageEvent> {
        let id: String = row.get("id");
        let metadata: String = row.get("metadata");
        let recorded_at: i64 = row.get("recorded_at");

        Ok(UsageEvent {
            id: Uuid::parse_str(&id)
                .map_err(|e| StorageError::Internal(format!("Invalid UUID in database: {}", e)))?,
            project: row.get("project_name"),
            request_type: row.get("request_type"),
            input_tokens: row.get("input_tokens"),
            output_tokens: row.get("output_tokens"),
            metadata: serde_json::from_str::<Metadata>(&metadata)?,
            timestamp: millis_to_datetime(recorded_at)?,
        })
    }
}

fn millis_to_datetime(millis: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Internal(format!("Invalid timestamp in database: {}", millis)))
}

/// `WHERE` clause restricting `recorded_at` to `[from, to)`.
fn time_range_clause(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> String {
    let mut conditions = Vec::new();
    if from.is_some() {
        conditions.push("recorded_at >= ?");
    }
    if to.is_some() {
        conditions.push("recorded_at < ?");
    }
    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

#[async_trait]
impl StorageGateway for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn write_batch(&self, events: &[UsageEvent]) -> StorageResult<WriteReport> {
        if events.is_empty() {
            return Ok(WriteReport::complete());
        }

        // One transaction for the whole batch: either every event lands or none
        // does, and INSERT OR IGNORE makes a retried batch idempotent.
        let mut tx = self.pool.begin().await?;

        for chunk in events.chunks(MAX_EVENTS_PER_STATEMENT) {
            let placeholders: Vec<&str> = chunk.iter().map(|_| "(?, ?, ?, ?, ?, ?, ?)").collect();

            let sql = format!(
                r#"
                INSERT OR IGNORE INTO usage_events (
                    id, project_name, request_type, input_tokens, output_tokens,
                    metadata, recorded_at
                )
                VALUES {}
                "#,
                placeholders.join(", ")
            );

            let mut query = sqlx::query(&sql);
            for event in chunk {
                query = query
                    .bind(event.id.to_string())
                    .bind(&event.project)
                    .bind(&event.request_type)
                    .bind(event.input_tokens)
                    .bind(event.output_tokens)
                    .bind(serde_json::to_string(&event.metadata)?)
                    .bind(event.timestamp.timestamp_millis());
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(WriteReport::complete())
    }

    async fn query(&self, query: &UsageQuery) -> StorageResult<UsagePage> {
        let after = cursor::decode_opt(query.cursor.as_deref())?;
        let limit = query.effective_limit();

        let mut conditions = Vec::new();
        if query.project.is_some() {
            conditions.push("project_name = ?");
        }
        if query.request_type.is_some() {
            conditions.push("request_type = ?");
        }
        if query.time_from.is_some() {
            conditions.push("recorded_at >= ?");
        }
        if query.time_to.is_some() {
            conditions.push("recorded_at < ?");
        }
        // (recorded_at, id) keeps the order total when events share a millisecond
        if after.is_some() {
            conditions.push("(recorded_at, id) < (?, ?)");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            r#"
            SELECT {}
            FROM usage_events
            {}
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?
            "#,
            SELECT_COLUMNS, where_clause
        );

        let mut query_builder = sqlx::query(&sql);
        if let Some(project) = &query.project {
            query_builder = query_builder.bind(project);
        }
        if let Some(request_type) = &query.request_type {
            query_builder = query_builder.bind(request_type);
        }
        if let Some(from) = query.time_from {
            query_builder = query_builder.bind(from.timestamp_millis());
        }
        if let Some(to) = query.time_to {
            query_builder = query_builder.bind(to.timestamp_millis());
        }
        if let Some(c) = after {
            query_builder = query_builder
                .bind(c.timestamp_millis())
                .bind(c.id.to_string());
        }
        query_builder = query_builder.bind((limit + 1) as i64);

        let rows = query_builder.fetch_all(&self.pool).await?;
        let events = rows
            .iter()
            .map(Self::parse_event)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(cursor::page_from_rows(events, limit))
    }

    async fn aggregate(
        &self,
        group_by: GroupBy,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<AggregateBucket>> {
        let where_clause = time_range_clause(from, to);

        let group_expr = match group_by.bucket_millis() {
            // SQLite integer division truncates toward zero; floor so
            // pre-1970 events land in the same bucket as `GroupBy::truncate`.
            Some(width) => format!("recorded_at - (((recorded_at % {width}) + {width}) % {width})"),
            None if group_by == GroupBy::Project => "project_name".to_string(),
            None => "request_type".to_string(),
        };

        let sql = format!(
            r#"
            SELECT {} AS group_key,
                   COUNT(*) AS count_requests,
                   COALESCE(SUM(input_tokens), 0) AS sum_input,
                   COALESCE(SUM(output_tokens), 0) AS sum_output
            FROM usage_events
            {}
            GROUP BY group_key
            "#,
            group_expr, where_clause
        );

        let mut query_builder = sqlx::query(&sql);
        if let Some(from) = from {
            query_builder = query_builder.bind(from.timestamp_millis());
        }
        if let Some(to) = to {
            query_builder = query_builder.bind(to.timestamp_millis());
        }

        let rows = query_builder.fetch_all(&self.pool).await?;

        let mut groups = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = if group_by.is_time() {
                BucketKey::Time(millis_to_datetime(row.get("group_key"))?)
            } else {
                BucketKey::Dimension(row.get("group_key"))
            };
            let totals = BucketTotals {
                count: row.get("count_requests"),
                sum_input: row.get("sum_input"),
                sum_output: row.get("sum_output"),
            };
            groups.push((key, totals));
        }

        Ok(buckets_from_totals(group_by, groups))
    }

    async fn health_check(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "SQLite health check failed");
                false
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
