//! Background delivery of buffered events to the storage backend.
//!
//! One worker task per client moves events from the [`EventBuffer`] to the
//! [`StorageGateway`] in batches. It is the only path that writes to storage,
//! and the only caller of the [`CircuitBreaker`], so producers never block on
//! I/O or contend on breaker state.
//!
//! The worker wakes when:
//! - the flush interval elapses,
//! - producers have filled at least one full batch,
//! - a [`flush`](DeliveryWorker::flush) request arrives,
//! - shutdown is signalled.
//!
//! After a failed batch it backs off exponentially; while backing off only a
//! flush request or shutdown wakes it early. On shutdown it closes the buffer,
//! drains what it can within the shutdown timeout, counts the rest as dropped
//! and releases the storage adapter.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{Notify, mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    buffer::EventBuffer,
    circuit_breaker::CircuitBreaker,
    config::DeliveryConfig,
    observability::metrics,
    storage::{StorageError, StorageGateway},
};

/// Pending flush requests the worker has not picked up yet.
const FLUSH_QUEUE_DEPTH: usize = 16;

/// A caller waiting for the buffer to be drained.
struct FlushRequest {
    deadline: Instant,
    /// Events delivered so far by this flush, readable if the caller gives up.
    progress: Arc<AtomicU64>,
    done: oneshot::Sender<u64>,
}

/// Result of a single batch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    /// Nothing to deliver.
    Idle,
    /// The circuit breaker refused the attempt.
    Denied,
    /// The whole batch was stored.
    Delivered(u64),
    /// The batch failed, entirely or in part; `delivered` events were stored.
    Failed { delivered: u64 },
}

struct Shared {
    buffer: Arc<EventBuffer>,
    breaker: Arc<CircuitBreaker>,
    storage: Arc<dyn StorageGateway>,
    config: DeliveryConfig,
    wake: Notify,
    delivered: AtomicU64,
    failed_batches: AtomicU64,
}

/// Handle to the background delivery task.
///
/// Dropping the handle signals shutdown; the task still performs its bounded
/// final drain in the background.
pub struct DeliveryWorker {
    shared: Arc<Shared>,
    flush_tx: mpsc::Sender<FlushRequest>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryWorker {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(
        buffer: Arc<EventBuffer>,
        breaker: Arc<CircuitBreaker>,
        storage: Arc<dyn StorageGateway>,
        config: DeliveryConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            buffer,
            breaker,
            storage,
            config,
            wake: Notify::new(),
            delivered: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        });
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run(Arc::clone(&shared), flush_rx, shutdown.clone()));

        tracing::debug!(
            backend = shared.storage.name(),
            batch_size = shared.config.batch_size,
            flush_interval_ms = shared.config.flush_interval_ms,
            "Delivery worker started"
        );

        Self {
            shared,
            flush_tx,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Wake the worker early if producers have filled a full batch.
    pub fn notify_enqueued(&self) {
        if self.shared.buffer.len() >= self.shared.config.batch_size {
            self.shared.wake.notify_one();
        }
    }

    /// Ask the worker to drain the buffer, waiting at most `timeout`.
    ///
    /// Returns the number of events this flush delivered. Failed batches are
    /// retried after backoff until the deadline; the flush stops early when
    /// the buffer is empty or the circuit breaker denies delivery.
    pub async fn flush(&self, timeout: Duration) -> u64 {
        if self.shutdown.is_cancelled() {
            return 0;
        }

        let deadline = Instant::now() + timeout;
        let progress = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = oneshot::channel();
        let request = FlushRequest {
            deadline,
            progress: Arc::clone(&progress),
            done: done_tx,
        };

        let waited = tokio::time::timeout_at(deadline, async {
            self.flush_tx.send(request).await.ok()?;
            done_rx.await.ok()
        })
        .await;

        match waited {
            Ok(Some(delivered)) => delivered,
            _ => progress.load(Ordering::Acquire),
        }
    }

    /// Signal shutdown and wait for the final drain to finish.
    pub async fn shutdown(&self) {
        self.signal_shutdown();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Delivery worker task failed");
        }
    }

    /// Refuse new events and stop the run loop.
    fn signal_shutdown(&self) {
        self.shared.buffer.close();
        self.shutdown.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Total events confirmed stored since the worker started.
    pub fn delivered_count(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Total batch attempts that failed, entirely or in part.
    pub fn failed_batches(&self) -> u64 {
        self.shared.failed_batches.load(Ordering::Relaxed)
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

async fn run(
    shared: Arc<Shared>,
    mut flush_rx: mpsc::Receiver<FlushRequest>,
    shutdown: CancellationToken,
) {
    let flush_interval = shared.config.flush_interval();
    let mut next_tick = Instant::now() + flush_interval;
    let mut attempt: u32 = 0;
    let mut backoff_until: Option<Instant> = None;

    loop {
        let wake_at = backoff_until.unwrap_or(next_tick);

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            Some(request) = flush_rx.recv() => {
                let delivered = shared
                    .drain_until(request.deadline, Some(&request.progress), Some(&shutdown), false)
                    .await;
                let _ = request.done.send(delivered);
                continue;
            }

            _ = shared.wake.notified(), if backoff_until.is_none() => {}

            _ = tokio::time::sleep_until(wake_at) => {}
        }

        match shared.delivery_cycle(&shutdown).await {
            BatchOutcome::Failed { .. } => {
                let delay = shared.config.retry.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                backoff_until = Some(Instant::now() + delay);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off after failed delivery"
                );
            }
            _ => {
                attempt = 0;
                backoff_until = None;
            }
        }
        next_tick = Instant::now() + flush_interval;
    }

    shared.shutdown_drain().await;
}

impl Shared {
    /// Deliver batch after batch until the buffer is empty, the breaker
    /// denies, a batch fails, or shutdown is signalled.
    async fn delivery_cycle(&self, shutdown: &CancellationToken) -> BatchOutcome {
        let mut delivered = 0u64;
        while !shutdown.is_cancelled() {
            match self.deliver_batch(None).await {
                BatchOutcome::Delivered(n) => delivered += n,
                BatchOutcome::Failed { delivered: n } => {
                    return BatchOutcome::Failed {
                        delivered: delivered + n,
                    };
                }
                outcome @ (BatchOutcome::Idle | BatchOutcome::Denied) => {
                    if delivered > 0 {
                        tracing::debug!(delivered, "Delivery cycle complete");
                    }
                    return outcome;
                }
            }
        }
        BatchOutcome::Delivered(delivered)
    }

    /// Drain with retries until the buffer is empty, the breaker denies, or
    /// `deadline` passes. Returns the number of events delivered.
    ///
    /// With `cap_writes`, a write still running at `deadline` is abandoned so
    /// the drain never outlives it.
    async fn drain_until(
        &self,
        deadline: Instant,
        progress: Option<&AtomicU64>,
        interrupt: Option<&CancellationToken>,
        cap_writes: bool,
    ) -> u64 {
        let write_cap = cap_writes.then_some(deadline);
        let mut total = 0u64;
        let mut attempt: u32 = 0;

        while Instant::now() < deadline {
            let delivered = match self.deliver_batch(write_cap).await {
                BatchOutcome::Idle | BatchOutcome::Denied => break,
                BatchOutcome::Delivered(n) => {
                    attempt = 0;
                    n
                }
                BatchOutcome::Failed { delivered } => {
                    let retry_at =
                        Instant::now() + self.config.retry.delay_for_attempt(attempt);
                    attempt = attempt.saturating_add(1);
                    total += delivered;
                    if let Some(progress) = progress {
                        progress.fetch_add(delivered, Ordering::AcqRel);
                    }
                    if retry_at >= deadline {
                        break;
                    }
                    match interrupt {
                        Some(token) => {
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = tokio::time::sleep_until(retry_at) => {}
                            }
                        }
                        None => tokio::time::sleep_until(retry_at).await,
                    }
                    continue;
                }
            };

            total += delivered;
            if let Some(progress) = progress {
                progress.fetch_add(delivered, Ordering::AcqRel);
            }
        }

        total
    }

    /// Attempt to deliver one batch from the front of the buffer.
    ///
    /// The write is bounded by the write timeout and, when given, `write_cap`.
    async fn deliver_batch(&self, write_cap: Option<Instant>) -> BatchOutcome {
        if self.buffer.is_empty() {
            return BatchOutcome::Idle;
        }
        if !self.breaker.allow() {
            return BatchOutcome::Denied;
        }

        let batch = self.buffer.dequeue_batch(self.config.batch_size);
        if batch.is_empty() {
            self.breaker.release_probe();
            return BatchOutcome::Idle;
        }

        let backend = self.storage.name();
        let size = batch.len();
        let started = Instant::now();
        let mut write_deadline = started + self.config.write_timeout();
        if let Some(cap) = write_cap {
            write_deadline = write_deadline.min(cap);
        }

        let result =
            match tokio::time::timeout_at(write_deadline, self.storage.write_batch(&batch)).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout(
                    write_deadline.saturating_duration_since(started),
                )),
            };
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(report) if report.is_complete() => {
                self.breaker.record_success();
                self.record_delivered(size as u64);
                metrics::record_batch_delivery(backend, "success", size, elapsed);
                tracing::debug!(backend, count = size, "Usage batch delivered");
                BatchOutcome::Delivered(size as u64)
            }
            Ok(report) => {
                let failed: HashSet<Uuid> = report.failed_ids().iter().copied().collect();
                let retained: Vec<_> = batch
                    .into_iter()
                    .filter(|event| failed.contains(&event.id))
                    .collect();
                let stored = (size - retained.len()) as u64;

                self.breaker.record_failure();
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.record_delivered(stored);
                metrics::record_batch_delivery(backend, "partial", size, elapsed);
                tracing::warn!(
                    backend,
                    stored,
                    failed = retained.len(),
                    "Usage batch partially delivered, requeueing failed events"
                );

                self.buffer.requeue_front(retained);
                BatchOutcome::Failed { delivered: stored }
            }
            Err(e) => {
                let outcome = if matches!(e, StorageError::Timeout(_)) {
                    "timeout"
                } else {
                    "failure"
                };

                self.breaker.record_failure();
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                metrics::record_batch_delivery(backend, outcome, size, elapsed);
                tracing::warn!(
                    backend,
                    error = %e,
                    count = size,
                    "Usage batch delivery failed, requeueing"
                );

                self.buffer.requeue_front(batch);
                BatchOutcome::Failed { delivered: 0 }
            }
        }
    }

    fn record_delivered(&self, count: u64) {
        if count > 0 {
            self.delivered.fetch_add(count, Ordering::Relaxed);
            metrics::record_events_delivered(self.storage.name(), count);
        }
    }

    async fn shutdown_drain(&self) {
        self.buffer.close();

        let deadline = Instant::now() + self.config.shutdown_timeout();
        let delivered = self.drain_until(deadline, None, None, true).await;

        let remaining = self.buffer.drain_remaining();
        if !remaining.is_empty() {
            tracing::warn!(
                count = remaining.len(),
                "Dropping undelivered usage events at shutdown"
            );
            self.buffer.count_dropped(remaining.len() as u64, "shutdown");
        }

        self.storage.close().await;
        tracing::info!(
            backend = self.storage.name(),
            delivered,
            dropped = remaining.len(),
            "Delivery worker stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        circuit_breaker::CircuitState,
        config::{CircuitBreakerConfig, OverflowPolicy, RetryConfig},
        models::{NewUsageEvent, UsageEvent},
        storage::test_utils::{ScriptedStorage, WriteOutcome},
    };

    struct Harness {
        worker: DeliveryWorker,
        buffer: Arc<EventBuffer>,
        breaker: Arc<CircuitBreaker>,
        storage: Arc<ScriptedStorage>,
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            batch_size: 100,
            flush_interval_ms: 1000,
            write_timeout_ms: 10_000,
            shutdown_timeout_ms: 5000,
            retry: RetryConfig {
                jitter: 0.0,
                ..Default::default()
            },
        }
    }

    fn start(config: DeliveryConfig, breaker_config: CircuitBreakerConfig) -> Harness {
        let buffer = Arc::new(EventBuffer::new(10_000, OverflowPolicy::DropNewest));
        let breaker = Arc::new(CircuitBreaker::new("scripted", &breaker_config));
        let storage = Arc::new(ScriptedStorage::new());
        let worker = DeliveryWorker::start(
            Arc::clone(&buffer),
            Arc::clone(&breaker),
            Arc::clone(&storage) as Arc<dyn StorageGateway>,
            config,
        );
        Harness {
            worker,
            buffer,
            breaker,
            storage,
        }
    }

    fn event() -> UsageEvent {
        NewUsageEvent::new("app", "chat", 10, 5).into_event().unwrap()
    }

    fn fill(buffer: &EventBuffer, n: usize) {
        for _ in 0..n {
            assert!(buffer.enqueue(event()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_delivers_everything_in_batches() {
        let h = start(config(), CircuitBreakerConfig::default());
        fill(&h.buffer, 250);

        let delivered = h.worker.flush(Duration::from_secs(5)).await;

        assert_eq!(delivered, 250);
        assert_eq!(h.storage.batch_sizes(), vec![100, 100, 50]);
        assert_eq!(h.worker.delivered_count(), 250);
        assert!(h.buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_empty_buffer_returns_zero() {
        let h = start(config(), CircuitBreakerConfig::default());
        assert_eq!(h.worker.flush(Duration::from_secs(1)).await, 0);
        assert_eq!(h.storage.write_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_delivers_without_flush() {
        let h = start(config(), CircuitBreakerConfig::default());
        fill(&h.buffer, 3);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(h.storage.stored(), 3);
        assert_eq!(h.worker.delivered_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_wakes_worker_before_interval() {
        let h = start(
            DeliveryConfig {
                batch_size: 10,
                flush_interval_ms: 60_000,
                ..config()
            },
            CircuitBreakerConfig::default(),
        );
        fill(&h.buffer, 10);
        h.worker.notify_enqueued();

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.storage.stored(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batches_are_requeued_and_retried() {
        let h = start(config(), CircuitBreakerConfig::default());
        h.storage.fail_next(2);
        fill(&h.buffer, 5);

        let delivered = h.worker.flush(Duration::from_secs(10)).await;

        assert_eq!(delivered, 5);
        assert_eq!(h.storage.write_calls(), 3);
        assert_eq!(h.storage.batch_sizes(), vec![5, 5, 5]);
        assert_eq!(h.worker.failed_batches(), 2);
        assert_eq!(h.storage.stored(), 5);
        assert_eq!(h.breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_write_requeues_only_failed_events() {
        let h = start(config(), CircuitBreakerConfig::default());
        h.storage.script([WriteOutcome::Partial(3)]);
        fill(&h.buffer, 5);

        let delivered = h.worker.flush(Duration::from_secs(10)).await;

        assert_eq!(delivered, 5);
        assert_eq!(h.storage.batch_sizes(), vec![5, 2]);
        assert_eq!(h.storage.stored(), 5);
        assert_eq!(h.worker.failed_batches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_backend_calls() {
        let h = start(
            config(),
            CircuitBreakerConfig {
                failure_threshold: 5,
                ..Default::default()
            },
        );
        h.storage.set_fail_always(true);
        fill(&h.buffer, 1);

        let delivered = h.worker.flush(Duration::from_secs(60)).await;

        assert_eq!(delivered, 0);
        assert_eq!(h.storage.write_calls(), 5);
        assert_eq!(h.breaker.state(), CircuitState::Open);
        assert_eq!(h.buffer.len(), 1);

        // Further flushes are denied without touching the backend.
        assert_eq!(h.worker.flush(Duration::from_secs(1)).await, 0);
        assert_eq!(h.storage.write_calls(), 5);
        assert_eq!(h.worker.delivered_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_recovers_delivery() {
        let h = start(
            config(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                open_timeout_ms: 30_000,
                ..Default::default()
            },
        );
        h.storage.fail_next(1);
        fill(&h.buffer, 2);

        assert_eq!(h.worker.flush(Duration::from_secs(5)).await, 0);
        assert_eq!(h.breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_secs(31)).await;

        // The periodic cycle after the cool-down probes and recovers.
        assert_eq!(h.storage.stored(), 2);
        assert_eq!(h.breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_times_out_as_failure() {
        let h = start(
            config(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        h.storage.set_write_delay(Some(Duration::from_secs(20)));
        fill(&h.buffer, 1);

        let delivered = h.worker.flush(Duration::from_secs(15)).await;

        assert_eq!(delivered, 0);
        assert_eq!(h.worker.failed_batches(), 1);
        assert_eq!(h.breaker.state(), CircuitState::Open);
        assert_eq!(h.buffer.len(), 1);
        assert_eq!(h.storage.stored(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_and_closes_storage() {
        let h = start(config(), CircuitBreakerConfig::default());
        fill(&h.buffer, 3);

        h.worker.shutdown().await;

        assert_eq!(h.storage.stored(), 3);
        assert!(h.storage.is_closed());
        assert!(h.buffer.is_closed());
        assert!(!h.buffer.enqueue(event()));
        assert_eq!(h.buffer.dropped_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_counts_undeliverable_events_as_dropped() {
        let h = start(
            DeliveryConfig {
                shutdown_timeout_ms: 1000,
                ..config()
            },
            CircuitBreakerConfig::default(),
        );
        h.storage.set_fail_always(true);
        fill(&h.buffer, 3);

        h.worker.shutdown().await;

        assert_eq!(h.storage.stored(), 0);
        assert_eq!(h.buffer.dropped_count(), 3);
        assert!(h.buffer.is_empty());
        assert!(h.storage.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_hanging_write_at_deadline() {
        let h = start(
            DeliveryConfig {
                shutdown_timeout_ms: 1000,
                write_timeout_ms: 10_000,
                ..config()
            },
            CircuitBreakerConfig::default(),
        );
        h.storage.set_write_delay(Some(Duration::from_secs(60)));
        fill(&h.buffer, 1);

        let started = Instant::now();
        h.worker.shutdown().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed < Duration::from_millis(1100), "shutdown took {elapsed:?}");
        assert_eq!(h.storage.write_calls(), 1);
        assert_eq!(h.storage.stored(), 0);
        assert_eq!(h.buffer.dropped_count(), 1);
        assert!(h.storage.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_after_shutdown_returns_zero() {
        let h = start(config(), CircuitBreakerConfig::default());
        h.worker.shutdown().await;

        assert!(h.worker.is_shutting_down());
        assert_eq!(h.worker.flush(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_worker_still_drains() {
        let h = start(config(), CircuitBreakerConfig::default());
        fill(&h.buffer, 4);
        let storage = Arc::clone(&h.storage);

        drop(h.worker);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(storage.stored(), 4);
        assert!(storage.is_closed());
    }
}
