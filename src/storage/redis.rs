use std::{ops::ControlFlow, time::Duration};

use ::redis::{Client, aio::MultiplexedConnection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    StorageGateway, StorageResult, WriteReport,
    cursor::{self, Cursor},
};
use crate::{
    aggregation::{Aggregator, GroupBy},
    config::RedisConfig,
    models::{AggregateBucket, UsageEvent, UsagePage, UsageQuery},
};

/// Members fetched per round trip while scanning a sorted set.
const SCAN_CHUNK: usize = 500;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Storage adapter backed by Redis sorted sets.
///
/// Every event is stored as its JSON serialization, scored by its timestamp in
/// milliseconds, in a global set and in a per-project set. `id` is the first
/// serialized field, so members sharing a score sort by id and the set order
/// matches `(timestamp, id)`. Aggregation folds a range scan in process, one
/// chunk at a time.
pub struct RedisStorage {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisStorage {
    /// Connect to the configured server.
    pub async fn from_config(config: &RedisConfig) -> StorageResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn events_key(&self) -> String {
        format!("{}events", self.key_prefix)
    }

    fn project_key(&self, project: &str) -> String {
        format!("{}project:{}", self.key_prefix, project)
    }

    /// Newest-first scan of `key` between two score bounds, fetched
    /// `SCAN_CHUNK` members per round trip. Each decoded event is handed to
    /// `visit` as its chunk arrives; the scan stops early on `Break`.
    async fn scan_desc(
        &self,
        key: &str,
        max: &str,
        min: &str,
        mut visit: impl FnMut(UsageEvent) -> ControlFlow<()>,
    ) -> StorageResult<()> {
        let mut conn = self.connection.clone();
        let mut offset = 0usize;

        loop {
            let members: Vec<String> = ::redis::cmd("ZREVRANGEBYSCORE")
                .arg(key)
                .arg(max)
                .arg(min)
                .arg("LIMIT")
                .arg(offset)
                .arg(SCAN_CHUNK)
                .query_async(&mut conn)
                .await?;

            let fetched = members.len();
            for member in members {
                let event: UsageEvent = serde_json::from_str(&member)?;
                if visit(event).is_break() {
                    return Ok(());
                }
            }

            if fetched < SCAN_CHUNK {
                return Ok(());
            }
            offset += fetched;
        }
    }
}

/// Score bounds (`max`, `min`) for a newest-first range scan.
///
/// `from` is inclusive and `to` exclusive. A cursor caps the range at its own
/// millisecond inclusively; ties on that millisecond are resolved by id.
fn score_bounds(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    after: Option<&Cursor>,
) -> (String, String) {
    let min = from.map_or_else(|| "-inf".to_string(), |f| f.timestamp_millis().to_string());

    let to_bound = to.map(|t| t.timestamp_millis());
    let cursor_bound = after.map(Cursor::timestamp_millis);
    let max = match (to_bound, cursor_bound) {
        (Some(t), Some(c)) if t <= c => format!("({}", t),
        (_, Some(c)) => c.to_string(),
        (Some(t), None) => format!("({}", t),
        (None, None) => "+inf".to_string(),
    };

    (max, min)
}

#[async_trait]
impl StorageGateway for RedisStorage {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn write_batch(&self, events: &[UsageEvent]) -> StorageResult<WriteReport> {
        if events.is_empty() {
            return Ok(WriteReport::complete());
        }

        let events_key = self.events_key();
        let mut pipe = ::redis::pipe();
        pipe.atomic();

        for event in events {
            let member = serde_json::to_string(event)?;
            let score = event.timestamp.timestamp_millis();
            pipe.cmd("ZADD")
                .arg(&events_key)
                .arg(score)
                .arg(&member)
                .ignore();
            pipe.cmd("ZADD")
                .arg(self.project_key(&event.project))
                .arg(score)
                .arg(&member)
                .ignore();
        }

        let mut conn = self.connection.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(WriteReport::complete())
    }

    async fn query(&self, query: &UsageQuery) -> StorageResult<UsagePage> {
        let after = cursor::decode_opt(query.cursor.as_deref())?;
        let limit = query.effective_limit();

        let key = match &query.project {
            Some(project) => self.project_key(project),
            None => self.events_key(),
        };
        let (max, min) = score_bounds(query.time_from, query.time_to, after.as_ref());

        let wanted = limit + 1;
        let mut rows = Vec::with_capacity(wanted);
        self.scan_desc(&key, &max, &min, |event| {
            if query.matches(&event) && after.is_none_or(|c| c.precedes(&event)) {
                rows.push(event);
                if rows.len() >= wanted {
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        })
        .await?;

        Ok(cursor::page_from_rows(rows, limit))
    }

    async fn aggregate(
        &self,
        group_by: GroupBy,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<AggregateBucket>> {
        let (max, min) = score_bounds(from, to, None);
        let mut aggregator = Aggregator::new(group_by, from, to);
        self.scan_desc(&self.events_key(), &max, &min, |event| {
            aggregator.push(&event);
            ControlFlow::Continue(())
        })
        .await?;

        Ok(aggregator.finish())
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.connection.clone();
        let ping = ::redis::cmd("PING").query_async::<String>(&mut conn);
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, ping).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Redis health check failed");
                false
            }
            Err(_) => {
                tracing::debug!("Redis health check timed out");
                false
            }
        }
    }
}
