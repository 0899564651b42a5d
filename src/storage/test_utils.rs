//! Storage double for delivery and client tests.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{MemoryStorage, StorageError, StorageGateway, StorageResult, WriteReport};
use crate::{
    aggregation::GroupBy,
    models::{AggregateBucket, UsageEvent, UsagePage, UsageQuery},
};

/// Scripted outcome for one `write_batch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Store every event.
    Succeed,
    /// Store nothing and return an error.
    Fail,
    /// Store only the first `n` events and report the rest as failed.
    Partial(usize),
}

/// In-memory storage whose writes can be scripted to fail.
///
/// Writes that succeed land in an inner [`MemoryStorage`], so queries and
/// aggregates observe exactly what was delivered.
#[derive(Debug, Default)]
pub struct ScriptedStorage {
    inner: MemoryStorage,
    script: Mutex<VecDeque<WriteOutcome>>,
    fail_always: AtomicBool,
    unhealthy: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
    write_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    closed: AtomicBool,
}

impl ScriptedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next writes; once exhausted writes succeed.
    pub fn script(&self, outcomes: impl IntoIterator<Item = WriteOutcome>) {
        self.script.lock().extend(outcomes);
    }

    /// Fail the next `n` writes.
    pub fn fail_next(&self, n: usize) {
        self.script(std::iter::repeat_n(WriteOutcome::Fail, n));
    }

    /// Fail every write until cleared.
    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Sleep for `delay` inside every write before applying its outcome.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Number of `write_batch` calls, successful or not.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Size of every batch passed to `write_batch`, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    /// Number of events stored.
    pub fn stored(&self) -> usize {
        self.inner.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> WriteOutcome {
        if self.fail_always.load(Ordering::SeqCst) {
            return WriteOutcome::Fail;
        }
        self.script
            .lock()
            .pop_front()
            .unwrap_or(WriteOutcome::Succeed)
    }
}

#[async_trait]
impl StorageGateway for ScriptedStorage {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn write_batch(&self, events: &[UsageEvent]) -> StorageResult<WriteReport> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().push(events.len());

        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_outcome() {
            WriteOutcome::Succeed => self.inner.write_batch(events).await,
            WriteOutcome::Fail => Err(StorageError::Unavailable("scripted failure".into())),
            WriteOutcome::Partial(stored) => {
                let stored = stored.min(events.len());
                self.inner.write_batch(&events[..stored]).await?;
                Ok(WriteReport::partial(
                    events[stored..].iter().map(|e| e.id).collect(),
                ))
            }
        }
    }

    async fn query(&self, query: &UsageQuery) -> StorageResult<UsagePage> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("scripted outage".into()));
        }
        self.inner.query(query).await
    }

    async fn aggregate(
        &self,
        group_by: GroupBy,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<AggregateBucket>> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("scripted outage".into()));
        }
        self.inner.aggregate(group_by, from, to).await
    }

    async fn health_check(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
