use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow, types::Json};

use super::{StorageGateway, StorageResult, WriteReport, cursor};
use crate::{
    aggregation::{BucketKey, BucketTotals, GroupBy, buckets_from_totals},
    config::PostgresConfig,
    models::{AggregateBucket, Metadata, UsageEvent, UsagePage, UsageQuery},
};

/// PostgreSQL allows 65535 bind parameters per statement; 7 per event.
const MAX_EVENTS_PER_STATEMENT: usize = 1000;

/// Storage adapter backed by PostgreSQL.
///
/// Timestamps are `TIMESTAMPTZ`, metadata is `JSONB`. Time buckets are computed
/// with `date_trunc` in UTC.
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open the pool described by `config`, running migrations if enabled.
    pub async fn from_config(config: &PostgresConfig) -> StorageResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        if config.run_migrations {
            Self::run_migrations(&pool).await?;
        }

        Ok(Self::new(pool))
    }

    /// Run PostgreSQL migrations using sqlx's migration runner.
    pub async fn run_migrations(pool: &PgPool) -> StorageResult<()> {
        tracing::info!("Running PostgreSQL migrations");
        sqlx::migrate!("./migrations_sqlx/postgres").run(pool).await?;
        tracing::info!("PostgreSQL migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn parse_event(row: &PgRow) -> UsageEvent {
        let metadata: Json<Metadata> = row.get("metadata");
        UsageEvent {
            id: row.get("id"),
            project: row.get("project_name"),
            request_type: row.get("request_type"),
            input_tokens: row.get("input_tokens"),
            output_tokens: row.get("output_tokens"),
            metadata: metadata.0,
            timestamp: row.get("recorded_at"),
        }
    }
}

/// Numbered placeholder generator for dynamically built statements.
struct Placeholders(usize);

impl Placeholders {
    fn new() -> Self {
        Self(0)
    }

    fn next_param(&mut self) -> String {
        self.0 += 1;
        format!("${}", self.0)
    }
}

#[async_trait]
impl StorageGateway for PostgresStorage {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn write_batch(&self, events: &[UsageEvent]) -> StorageResult<WriteReport> {
        if events.is_empty() {
            return Ok(WriteReport::complete());
        }

        let mut tx = self.pool.begin().await?;

        for chunk in events.chunks(MAX_EVENTS_PER_STATEMENT) {
            let mut params = Placeholders::new();
            let rows: Vec<String> = chunk
                .iter()
                .map(|_| {
                    let cols: Vec<String> = (0..7).map(|_| params.next_param()).collect();
                    format!("({})", cols.join(", "))
                })
                .collect();

            let sql = format!(
                r#"
                INSERT INTO usage_events (
                    id, project_name, request_type, input_tokens, output_tokens,
                    metadata, recorded_at
                )
                VALUES {}
                ON CONFLICT (id) DO NOTHING
                "#,
                rows.join(", ")
            );

            let mut query = sqlx::query(&sql);
            for event in chunk {
                query = query
                    .bind(event.id)
                    .bind(&event.project)
                    .bind(&event.request_type)
                    .bind(event.input_tokens)
                    .bind(event.output_tokens)
                    .bind(Json(&event.metadata))
                    .bind(event.timestamp);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(WriteReport::complete())
    }

    async fn query(&self, query: &UsageQuery) -> StorageResult<UsagePage> {
        let after = cursor::decode_opt(query.cursor.as_deref())?;
        let limit = query.effective_limit();

        let mut params = Placeholders::new();
        let mut conditions = Vec::new();
        if query.project.is_some() {
            conditions.push(format!("project_name = {}", params.next_param()));
        }
        if query.request_type.is_some() {
            conditions.push(format!("request_type = {}", params.next_param()));
        }
        if query.time_from.is_some() {
            conditions.push(format!("recorded_at >= {}", params.next_param()));
        }
        if query.time_to.is_some() {
            conditions.push(format!("recorded_at < {}", params.next_param()));
        }
        if after.is_some() {
            let ts = params.next_param();
            let id = params.next_param();
            conditions.push(format!("(recorded_at, id) < ({}, {})", ts, id));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            r#"
            SELECT id, project_name, request_type, input_tokens, output_tokens,
                   metadata, recorded_at
            FROM usage_events
            {}
            ORDER BY recorded_at DESC, id DESC
            LIMIT {}
            "#,
            where_clause,
            params.next_param()
        );

        let mut query_builder = sqlx::query(&sql);
        if let Some(project) = &query.project {
            query_builder = query_builder.bind(project);
        }
        if let Some(request_type) = &query.request_type {
            query_builder = query_builder.bind(request_type);
        }
        if let Some(from) = query.time_from {
            query_builder = query_builder.bind(from);
        }
        if let Some(to) = query.time_to {
            query_builder = query_builder.bind(to);
        }
        if let Some(c) = after {
            query_builder = query_builder.bind(c.timestamp).bind(c.id);
        }
        query_builder = query_builder.bind((limit + 1) as i64);

        let rows = query_builder.fetch_all(&self.pool).await?;
        let events = rows.iter().map(Self::parse_event).collect();

        Ok(cursor::page_from_rows(events, limit))
    }

    async fn aggregate(
        &self,
        group_by: GroupBy,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<AggregateBucket>> {
        let group_expr = match group_by {
            GroupBy::Hour => "date_trunc('hour', recorded_at AT TIME ZONE 'UTC') AT TIME ZONE 'UTC'",
            GroupBy::Day => "date_trunc('day', recorded_at AT TIME ZONE 'UTC') AT TIME ZONE 'UTC'",
            GroupBy::Project => "project_name",
            GroupBy::RequestType => "request_type",
        };

        let mut params = Placeholders::new();
        let mut conditions = Vec::new();
        if from.is_some() {
            conditions.push(format!("recorded_at >= {}", params.next_param()));
        }
        if to.is_some() {
            conditions.push(format!("recorded_at < {}", params.next_param()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            r#"
            SELECT {} AS group_key,
                   COUNT(*)::BIGINT AS count_requests,
                   COALESCE(SUM(input_tokens), 0)::BIGINT AS sum_input,
                   COALESCE(SUM(output_tokens), 0)::BIGINT AS sum_output
            FROM usage_events
            {}
            GROUP BY 1
            "#,
            group_expr, where_clause
        );

        let mut query_builder = sqlx::query(&sql);
        if let Some(from) = from {
            query_builder = query_builder.bind(from);
        }
        if let Some(to) = to {
            query_builder = query_builder.bind(to);
        }

        let rows = query_builder.fetch_all(&self.pool).await?;

        let groups = rows.iter().map(|row| {
            let key = if group_by.is_time() {
                BucketKey::Time(row.get("group_key"))
            } else {
                BucketKey::Dimension(row.get("group_key"))
            };
            let totals = BucketTotals {
                count: row.get("count_requests"),
                sum_input: row.get("sum_input"),
                sum_output: row.get("sum_output"),
            };
            (key, totals)
        });

        Ok(buckets_from_totals(group_by, groups))
    }

    async fn health_check(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "PostgreSQL health check failed");
                false
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
