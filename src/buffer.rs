//! Bounded in-memory queue of events awaiting delivery.
//!
//! Producers call [`EventBuffer::enqueue`] from any thread; the delivery worker
//! is the only consumer. Every operation holds the lock for a single in-memory
//! mutation, so `enqueue` never waits on I/O.
//!
//! When the buffer is full one event is discarded according to the configured
//! [`OverflowPolicy`] and counted in [`EventBuffer::dropped_count`]. Producers
//! are never blocked and never see an error.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;

pub use crate::config::OverflowPolicy;
use crate::{models::UsageEvent, observability::metrics};

/// Bounded FIFO of pending usage events.
pub struct EventBuffer {
    queue: Mutex<VecDeque<UsageEvent>>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Count of events discarded since the buffer was created.
    dropped_count: AtomicU64,
    /// Set on shutdown; further enqueues are refused.
    closed: AtomicBool,
}

impl EventBuffer {
    /// Create a buffer holding at most `capacity` events (minimum 1).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            policy,
            dropped_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Add an event at the back of the queue.
    ///
    /// Returns whether the event was accepted. Under `DropNewest` a full buffer
    /// rejects the event; under `DropOldest` the oldest pending event is evicted
    /// and the new one is accepted. A closed buffer refuses everything without
    /// counting a drop.
    pub fn enqueue(&self, event: UsageEvent) -> bool {
        if self.is_closed() {
            return false;
        }

        let (accepted, dropped) = {
            let mut queue = self.queue.lock();
            if queue.len() < self.capacity {
                queue.push_back(event);
                (true, false)
            } else {
                match self.policy {
                    OverflowPolicy::DropNewest => (false, true),
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(event);
                        (true, true)
                    }
                }
            }
        };

        if dropped {
            self.count_dropped(1, "overflow");
        }
        accepted
    }

    /// Remove and return up to `max_size` of the oldest pending events.
    pub fn dequeue_batch(&self, max_size: usize) -> Vec<UsageEvent> {
        let mut queue = self.queue.lock();
        let take = max_size.min(queue.len());
        let batch: Vec<UsageEvent> = queue.drain(..take).collect();
        metrics::record_queue_depth(queue.len());
        batch
    }

    /// Put a failed batch back at the front of the queue, preserving its order.
    ///
    /// Only the free capacity is used: under `DropNewest` the oldest events of
    /// the batch survive, under `DropOldest` the newest. Events that do not fit
    /// are counted as dropped. Returns the number of events requeued.
    ///
    /// Requeueing is allowed after [`close`](Self::close) so the shutdown drain
    /// can still account for every event.
    pub fn requeue_front(&self, mut batch: Vec<UsageEvent>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let (requeued, overflow) = {
            let mut queue = self.queue.lock();
            let free = self.capacity.saturating_sub(queue.len());
            let overflow = batch.len().saturating_sub(free);

            if overflow > 0 {
                match self.policy {
                    OverflowPolicy::DropNewest => {
                        batch.truncate(free);
                    }
                    OverflowPolicy::DropOldest => {
                        batch.drain(..overflow);
                    }
                }
            }

            let requeued = batch.len();
            for event in batch.into_iter().rev() {
                queue.push_front(event);
            }
            metrics::record_queue_depth(queue.len());
            (requeued, overflow)
        };

        if overflow > 0 {
            self.count_dropped(overflow as u64, "requeue_overflow");
        }
        requeued
    }

    /// Current number of pending events.
    pub fn size(&self) -> usize {
        self.len()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Total events discarded since creation. Never decreases.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Refuse all further enqueues.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remove everything still pending.
    pub fn drain_remaining(&self) -> Vec<UsageEvent> {
        let mut queue = self.queue.lock();
        let remaining: Vec<UsageEvent> = queue.drain(..).collect();
        metrics::record_queue_depth(0);
        remaining
    }

    /// Count events lost outside the buffer's own overflow handling
    /// (e.g. still pending when the shutdown drain times out).
    pub(crate) fn count_dropped(&self, count: u64, reason: &'static str) {
        if count == 0 {
            return;
        }
        metrics::record_events_dropped(reason, count);
        let previous = self.dropped_count.fetch_add(count, Ordering::Relaxed);

        // Log once per 100 drops to avoid log spam
        let last = previous + count - 1;
        if previous.is_multiple_of(100) || previous / 100 != last / 100 {
            tracing::warn!(
                dropped_count = previous + count,
                capacity = self.capacity,
                reason,
                "Usage buffer dropping events (backend may be slow or unavailable)"
            );
        }
    }
}

impl std::fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("dropped_count", &self.dropped_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
