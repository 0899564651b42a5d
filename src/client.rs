//! Client facade for recording and reading token usage.
//!
//! [`UsageClient`] owns one buffer, one circuit breaker and one delivery worker.
//! Producers call [`log`](UsageClient::log), which validates the event and
//! hands it to the buffer without I/O. Delivery happens in the background;
//! backend failures during ingestion only show up in [`ClientStats`].
//!
//! ```rust,ignore
//! let client = UsageClient::connect("sqlite://usage.db").await?;
//! client.log("chatbot_app", "chat", 120, 80, None)?;
//! client.flush(Duration::from_secs(5)).await;
//! let page = client.query(&UsageQuery::for_project("chatbot_app")).await?;
//! client.close().await;
//! ```

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    aggregation::GroupBy,
    buffer::EventBuffer,
    circuit_breaker::{CircuitBreaker, CircuitState},
    config::Settings,
    delivery::DeliveryWorker,
    error::{UsageError, UsageResult, ValidationError},
    models::{AggregateBucket, Metadata, NewUsageEvent, UsagePage, UsageQuery},
    storage::{self, StorageGateway},
};

/// Point-in-time view of the client's pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    /// Events waiting for delivery.
    pub queue_size: usize,
    /// Maximum number of events the buffer holds.
    pub buffer_capacity: usize,
    /// Events discarded (buffer overflow, requeue overflow, shutdown).
    pub dropped_count: u64,
    pub circuit_state: CircuitState,
    /// Events confirmed stored by the backend.
    pub delivered_count: u64,
    /// Batch attempts that failed, entirely or in part.
    pub failed_batches: u64,
    pub backend: &'static str,
}

/// Entry point for recording and reading usage events.
///
/// Dropping a client without calling [`close`](Self::close) still signals the
/// worker to shut down; its bounded final drain then runs in the background.
pub struct UsageClient {
    buffer: Arc<EventBuffer>,
    breaker: Arc<CircuitBreaker>,
    storage: Arc<dyn StorageGateway>,
    worker: DeliveryWorker,
}

impl UsageClient {
    /// Connect the configured backend and start the delivery worker.
    pub async fn from_settings(settings: Settings) -> UsageResult<Self> {
        settings.check()?;
        let storage = storage::connect(&settings.backend).await?;
        Self::with_storage(storage, settings)
    }

    /// Build a client from a connection string with default settings.
    ///
    /// Accepts `redis://`, `rediss://`, `postgres://`, `postgresql://`,
    /// `sqlite://path`, `sqlite::memory:` and `memory://`.
    pub async fn connect(url: &str) -> UsageResult<Self> {
        Self::from_settings(Settings::from_url(url)?).await
    }

    /// Build a client around an already constructed storage adapter.
    ///
    /// `settings.backend` is ignored. Must be called within a tokio runtime.
    pub fn with_storage(storage: Arc<dyn StorageGateway>, settings: Settings) -> UsageResult<Self> {
        settings.check()?;

        let buffer = Arc::new(EventBuffer::new(
            settings.buffer.max_size,
            settings.buffer.overflow_policy,
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            storage.name(),
            &settings.circuit_breaker,
        ));
        let worker = DeliveryWorker::start(
            Arc::clone(&buffer),
            Arc::clone(&breaker),
            Arc::clone(&storage),
            settings.delivery,
        );

        tracing::info!(
            backend = storage.name(),
            buffer_size = buffer.capacity(),
            "Usage client started"
        );

        Ok(Self {
            buffer,
            breaker,
            storage,
            worker,
        })
    }

    /// Record one usage event.
    ///
    /// Returns whether the event was accepted into the buffer. A full buffer
    /// or a closed client yields `Ok(false)`; malformed input (blank names,
    /// negative token counts) is rejected with a [`ValidationError`]. Never
    /// performs I/O.
    pub fn log(
        &self,
        project: impl Into<String>,
        request_type: impl Into<String>,
        input_tokens: i64,
        output_tokens: i64,
        metadata: Option<Metadata>,
    ) -> Result<bool, ValidationError> {
        let mut event = NewUsageEvent::new(project, request_type, input_tokens, output_tokens);
        if let Some(metadata) = metadata {
            event.metadata = metadata;
        }
        self.log_event(event)
    }

    /// Struct-based form of [`log`](Self::log).
    pub fn log_event(&self, event: NewUsageEvent) -> Result<bool, ValidationError> {
        let event = event.into_event()?;
        let accepted = self.buffer.enqueue(event);
        if accepted {
            self.worker.notify_enqueued();
        }
        Ok(accepted)
    }

    /// Deliver buffered events now, waiting at most `timeout`.
    ///
    /// Returns the number of events this call delivered. Honours the circuit
    /// breaker: an open circuit makes this return early.
    pub async fn flush(&self, timeout: Duration) -> u64 {
        self.worker.flush(timeout).await
    }

    /// One page of stored events, newest first.
    ///
    /// Fails with [`UsageError::Closed`] once the client has shut down.
    pub async fn query(&self, query: &UsageQuery) -> UsageResult<UsagePage> {
        self.ensure_open()?;
        Ok(self.storage.query(query).await?)
    }

    /// Summary buckets of stored events in `[from, to)`.
    pub async fn aggregate(
        &self,
        group_by: GroupBy,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> UsageResult<Vec<AggregateBucket>> {
        self.ensure_open()?;
        Ok(self.storage.aggregate(group_by, from, to).await?)
    }

    /// Whether the backend is reachable. Always false once closed.
    pub async fn health_check(&self) -> bool {
        !self.is_closed() && self.storage.health_check().await
    }

    pub fn get_stats(&self) -> ClientStats {
        ClientStats {
            queue_size: self.buffer.size(),
            buffer_capacity: self.buffer.capacity(),
            dropped_count: self.buffer.dropped_count(),
            circuit_state: self.breaker.state(),
            delivered_count: self.worker.delivered_count(),
            failed_batches: self.worker.failed_batches(),
            backend: self.storage.name(),
        }
    }

    /// Stop accepting events, drain within the shutdown timeout, and release
    /// the backend. Idempotent; afterwards `log` returns `Ok(false)` and
    /// `flush` returns 0.
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
    }

    /// Shut down and consume the client.
    pub async fn close(self) {
        self.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.worker.is_shutting_down()
    }

    fn ensure_open(&self) -> UsageResult<()> {
        if self.is_closed() {
            return Err(UsageError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for UsageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageClient")
            .field("backend", &self.storage.name())
            .field("buffer", &self.buffer)
            .field("circuit_state", &self.breaker.state())
            .finish()
    }
}
