//! End-to-end client scenarios.
//!
//! Backend-agnostic scenarios are parameterized with rstest over every adapter
//! that runs without external services. Time-driven breaker scenarios use the
//! scripted storage double with a paused clock.

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use rstest::rstest;

use crate::{
    UsageClient,
    aggregation::{GroupBy, METRIC_COUNT_REQUESTS, METRIC_SUM_TOTAL},
    circuit_breaker::CircuitState,
    config::{CircuitBreakerConfig, OverflowPolicy, Settings},
    models::{Metadata, NewUsageEvent, UsageEvent, UsageQuery},
    storage::{MemoryStorage, StorageGateway, test_utils::ScriptedStorage},
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    #[cfg(feature = "database-sqlite")]
    Sqlite,
}

async fn storage_for(backend: Backend) -> Arc<dyn StorageGateway> {
    match backend {
        Backend::Memory => Arc::new(MemoryStorage::new()),
        #[cfg(feature = "database-sqlite")]
        Backend::Sqlite => Arc::new(
            crate::storage::SqliteStorage::from_config(&crate::config::SqliteConfig::default())
                .await
                .unwrap(),
        ),
    }
}

fn breaker_config(failure_threshold: u32, open_timeout_ms: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        open_timeout_ms,
        ..Default::default()
    }
}

fn event_at(project: &str, input: i64, output: i64, ts: chrono::DateTime<Utc>) -> UsageEvent {
    let mut event = NewUsageEvent::new(project, "chat", input, output)
        .into_event()
        .unwrap();
    event.timestamp = ts;
    event
}

// =============================================================================
// Backend-parameterized scenarios
// =============================================================================

#[rstest]
#[case::memory(Backend::Memory)]
#[cfg_attr(feature = "database-sqlite", case::sqlite(Backend::Sqlite))]
#[tokio::test]
async fn test_flush_delivers_every_logged_event(#[case] backend: Backend) {
    let client = UsageClient::with_storage(storage_for(backend).await, Settings::default()).unwrap();

    for i in 0..250 {
        assert!(client.log("chatbot_app", "chat", i, 1, None).unwrap());
    }
    assert_eq!(client.flush(FLUSH_TIMEOUT).await, 250);

    let mut seen = 0;
    let mut cursor: Option<String> = None;
    loop {
        let mut query = UsageQuery::for_project("chatbot_app").limit(100);
        if let Some(cursor) = cursor.take() {
            query = query.after(cursor);
        }
        let (events, next) = client.query(&query).await.unwrap().into_parts();
        seen += events.len();
        match next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen, 250);

    let stats = client.get_stats();
    assert_eq!(stats.delivered_count, 250);
    assert_eq!(stats.queue_size, 0);
    client.close().await;
}

#[rstest]
#[case::memory(Backend::Memory)]
#[cfg_attr(feature = "database-sqlite", case::sqlite(Backend::Sqlite))]
#[tokio::test]
async fn test_roundtrip_preserves_tokens_and_metadata(#[case] backend: Backend) {
    let client = UsageClient::with_storage(storage_for(backend).await, Settings::default()).unwrap();
    let mut metadata = Metadata::new();
    metadata.insert("model".into(), "gpt-4".into());

    client
        .log("chatbot_app", "chat", 120, 80, Some(metadata.clone()))
        .unwrap();
    client.flush(FLUSH_TIMEOUT).await;

    let page = client
        .query(&UsageQuery::for_project("chatbot_app"))
        .await
        .unwrap();
    assert_eq!(page.events.len(), 1);
    let event = &page.events[0];
    assert_eq!(event.input_tokens, 120);
    assert_eq!(event.output_tokens, 80);
    assert_eq!(event.metadata, metadata);
    assert_eq!(event.request_type, "chat");
    client.close().await;
}

#[rstest]
#[case::negative_input(-5, 10)]
#[case::negative_output(10, -1)]
#[tokio::test]
async fn test_negative_tokens_never_stored(#[case] input: i64, #[case] output: i64) {
    let client = UsageClient::with_storage(Arc::new(MemoryStorage::new()), Settings::default()).unwrap();

    assert!(client.log("app", "chat", input, output, None).is_err());
    client.log("app", "chat", 1, 1, None).unwrap();
    client.flush(FLUSH_TIMEOUT).await;

    let page = client.query(&UsageQuery::for_project("app")).await.unwrap();
    assert_eq!(page.events.len(), 1);
    assert!(
        page.events
            .iter()
            .all(|e| e.input_tokens >= 0 && e.output_tokens >= 0)
    );
}

#[rstest]
#[case::memory(Backend::Memory)]
#[cfg_attr(feature = "database-sqlite", case::sqlite(Backend::Sqlite))]
#[tokio::test]
async fn test_daily_aggregate_over_two_days(#[case] backend: Backend) {
    let storage = storage_for(backend).await;
    let day_one = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
    let day_one_late = Utc.with_ymd_and_hms(2025, 3, 1, 23, 59, 59).unwrap();
    let day_two = Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap();
    storage
        .write_batch(&[
            event_at("app", 100, 50, day_one),
            event_at("app", 10, 5, day_one_late),
            event_at("app", 7, 3, day_two),
        ])
        .await
        .unwrap();

    let client = UsageClient::with_storage(storage, Settings::default()).unwrap();
    let buckets = client.aggregate(GroupBy::Day, None, None).await.unwrap();

    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0].start, Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()));
    assert_eq!(buckets[0].metric(METRIC_COUNT_REQUESTS), Some(2.0));
    assert_eq!(buckets[0].metric(METRIC_SUM_TOTAL), Some(165.0));
    assert_eq!(buckets[1].start, Some(day_two));
    assert_eq!(buckets[1].metric(METRIC_COUNT_REQUESTS), Some(1.0));
    assert_eq!(buckets[1].metric(METRIC_SUM_TOTAL), Some(10.0));
    client.close().await;
}

// =============================================================================
// Buffer and breaker scenarios
// =============================================================================

#[tokio::test]
async fn test_full_buffer_drops_incoming_events() {
    let settings = Settings::default()
        .with_buffer_size(2)
        .with_overflow_policy(OverflowPolicy::DropNewest)
        .with_batch_size(2)
        .with_flush_interval(Duration::from_secs(3600));
    let client = UsageClient::with_storage(Arc::new(MemoryStorage::new()), settings).unwrap();

    // Logging never yields, so the worker cannot drain between these calls.
    client.log("app", "chat", 1, 1, None).unwrap();
    client.log("app", "chat", 1, 1, None).unwrap();
    client.log("app", "chat", 1, 1, None).unwrap();

    let stats = client.get_stats();
    assert_eq!(stats.queue_size, 2);
    assert_eq!(stats.dropped_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_skips_backend() {
    let storage = Arc::new(ScriptedStorage::new());
    storage.set_fail_always(true);
    let settings = Settings::default().with_circuit_breaker(breaker_config(5, 30_000));
    let client =
        UsageClient::with_storage(Arc::clone(&storage) as Arc<dyn StorageGateway>, settings)
            .unwrap();

    client.log("app", "chat", 1, 1, None).unwrap();
    assert_eq!(client.flush(FLUSH_TIMEOUT).await, 0);
    assert_eq!(storage.write_calls(), 5);
    assert_eq!(client.get_stats().circuit_state, CircuitState::Open);

    client.log("app", "chat", 1, 1, None).unwrap();
    assert_eq!(client.flush(FLUSH_TIMEOUT).await, 0);
    assert_eq!(storage.write_calls(), 5);

    let stats = client.get_stats();
    assert_eq!(stats.delivered_count, 0);
    assert_eq!(stats.queue_size, 2);
    assert_eq!(stats.circuit_state, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_recovers_after_cooldown() {
    let storage = Arc::new(ScriptedStorage::new());
    storage.fail_next(3);
    let settings = Settings::default()
        .with_flush_interval(Duration::from_secs(3600))
        .with_circuit_breaker(breaker_config(3, 1000));
    let client =
        UsageClient::with_storage(Arc::clone(&storage) as Arc<dyn StorageGateway>, settings)
            .unwrap();

    client.log("app", "chat", 1, 1, None).unwrap();
    client.flush(FLUSH_TIMEOUT).await;
    assert_eq!(client.get_stats().circuit_state, CircuitState::Open);

    tokio::time::advance(Duration::from_millis(1100)).await;

    assert_eq!(client.flush(FLUSH_TIMEOUT).await, 1);
    let stats = client.get_stats();
    assert_eq!(stats.circuit_state, CircuitState::Closed);
    assert_eq!(stats.delivered_count, 1);
    assert_eq!(storage.stored(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_count_is_monotonic_under_outage() {
    let storage = Arc::new(ScriptedStorage::new());
    storage.set_fail_always(true);
    let settings = Settings::default()
        .with_buffer_size(5)
        .with_batch_size(5)
        .with_circuit_breaker(breaker_config(1, 60_000));
    let client = UsageClient::with_storage(storage, settings).unwrap();

    let mut last = 0;
    for _ in 0..20 {
        client.log("app", "chat", 1, 1, None).unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        let dropped = client.get_stats().dropped_count;
        assert!(dropped >= last);
        last = dropped;
    }
    assert!(last >= 15);
    assert_eq!(client.get_stats().delivered_count, 0);
}

// =============================================================================
// Lifecycle scenarios
// =============================================================================

#[tokio::test]
async fn test_closed_client_is_inert() {
    let storage = Arc::new(MemoryStorage::new());
    let client = UsageClient::with_storage(
        Arc::clone(&storage) as Arc<dyn StorageGateway>,
        Settings::default(),
    )
    .unwrap();

    client.log("app", "chat", 3, 4, None).unwrap();
    client.shutdown().await;

    assert_eq!(storage.len(), 1);
    assert!(!client.log("app", "chat", 1, 1, None).unwrap());
    assert_eq!(client.flush(FLUSH_TIMEOUT).await, 0);
    assert_eq!(client.get_stats().queue_size, 0);
}

#[tokio::test]
async fn test_independent_clients_do_not_interfere() {
    let first = UsageClient::with_storage(Arc::new(MemoryStorage::new()), Settings::default()).unwrap();
    let second = UsageClient::with_storage(Arc::new(MemoryStorage::new()), Settings::default()).unwrap();

    first.log("a", "chat", 1, 1, None).unwrap();
    first.close().await;

    assert!(second.log("b", "chat", 1, 1, None).unwrap());
    assert_eq!(second.flush(FLUSH_TIMEOUT).await, 1);
    let page = second.query(&UsageQuery::default()).await.unwrap();
    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].project, "b");
    second.close().await;
}
