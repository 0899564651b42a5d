use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{
    StorageGateway, StorageResult, WriteReport,
    cursor::{self, Cursor},
};
use crate::{
    aggregation::{Aggregator, GroupBy},
    models::{AggregateBucket, UsageEvent, UsagePage, UsageQuery},
};

/// In-process storage ordered by `(timestamp, id)`.
///
/// Contents live as long as the value. Useful for tests, local development,
/// and applications that only need aggregates of the current process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    events: RwLock<BTreeMap<(DateTime<Utc>, Uuid), UsageEvent>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write_batch(&self, events: &[UsageEvent]) -> StorageResult<WriteReport> {
        let mut stored = self.events.write();
        for event in events {
            stored
                .entry((event.timestamp, event.id))
                .or_insert_with(|| event.clone());
        }
        Ok(WriteReport::complete())
    }

    async fn query(&self, query: &UsageQuery) -> StorageResult<UsagePage> {
        let after = cursor::decode_opt(query.cursor.as_deref())?;
        let limit = query.effective_limit();

        let stored = self.events.read();
        let candidates: Box<dyn Iterator<Item = &UsageEvent>> = match after {
            Some(Cursor { timestamp, id }) => {
                Box::new(stored.range(..(timestamp, id)).rev().map(|(_, e)| e))
            }
            None => Box::new(stored.values().rev()),
        };

        let rows: Vec<UsageEvent> = candidates
            .filter(|event| query.matches(event))
            .take(limit + 1)
            .cloned()
            .collect();

        Ok(cursor::page_from_rows(rows, limit))
    }

    async fn aggregate(
        &self,
        group_by: GroupBy,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<AggregateBucket>> {
        let mut aggregator = Aggregator::new(group_by, from, to);
        aggregator.extend(self.events.read().values());
        Ok(aggregator.finish())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
