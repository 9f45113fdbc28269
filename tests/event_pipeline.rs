use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use backend_core::events::manager::{CLEANUP_TASK, FLUSH_TASK};
use backend_core::events::{EventManagerSettings, EventStore, LogEvent, LogEventManager, SqliteEventStore};
use backend_core::lifecycle::Scheduler;
use backend_core::observability::Logged;

fn settings() -> EventManagerSettings {
    EventManagerSettings {
        flush_interval: Duration::from_millis(50),
        flush_batch_size: 20,
        max_flush_retries: 3,
        max_buffered: 10_000,
        retention: Duration::from_secs(30 * 24 * 3600),
        cleanup_interval: Duration::from_secs(3600),
        cleanup_batch_size: 3,
    }
}

#[tokio::test]
async fn test_scheduled_flush_persists_to_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.db");

    let store = Arc::new(SqliteEventStore::open(&path).await.unwrap());
    let manager = Arc::new(Logged::new("log_events", LogEventManager::new(store, settings())));
    let scheduler = Scheduler::new();
    LogEventManager::schedule(&manager, &scheduler).unwrap();
    scheduler.start().unwrap();

    for i in 0..25 {
        assert!(manager.ingest(LogEvent::new("order.updated", json!({ "seq": i }))));
    }

    // Wait for a scheduled flush to drain the buffer.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.stats().flushed < 25 {
        assert!(tokio::time::Instant::now() < deadline, "flush did not run");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    scheduler.shutdown().await;
    manager.shutdown().await.unwrap();

    let reopened = SqliteEventStore::open(&path).await.unwrap();
    assert_eq!(reopened.count().await.unwrap(), 25);
    let newest = reopened.recent(1).await.unwrap();
    assert_eq!(newest[0].payload["seq"], 24);
    assert_eq!(newest[0].id, Some(25));
    assert!(newest[0].processed);
}

#[tokio::test]
async fn test_cleanup_removes_only_expired_events() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteEventStore::open(dir.path().join("events.db")).await.unwrap());

    let expired: Vec<_> = (0..10)
        .map(|i| LogEvent::new("session.closed", json!({ "i": i })).created_at(Utc::now() - ChronoDuration::days(45)))
        .collect();
    let fresh: Vec<_> = (0..4)
        .map(|i| LogEvent::new("session.opened", json!({ "i": i })).created_at(Utc::now() - ChronoDuration::days(2)))
        .collect();
    store.insert_batch(&expired).await.unwrap();
    store.insert_batch(&fresh).await.unwrap();

    let manager = LogEventManager::new(store.clone(), settings());
    assert_eq!(manager.cleanup().await.unwrap(), 10);
    assert_eq!(manager.cleanup().await.unwrap(), 0);

    let left = store.recent(100).await.unwrap();
    assert_eq!(left.len(), 4);
    assert!(left.iter().all(|e| e.event_type == "session.opened"));
}

#[tokio::test]
async fn test_run_now_triggers_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteEventStore::open(dir.path().join("events.db")).await.unwrap());
    store
        .insert_batch(&[LogEvent::new("old", json!(null)).created_at(Utc::now() - ChronoDuration::days(90))])
        .await
        .unwrap();

    let manager = Arc::new(Logged::new("log_events", LogEventManager::new(store.clone(), settings())));
    let scheduler = Scheduler::new();
    LogEventManager::schedule(&manager, &scheduler).unwrap();
    scheduler.start().unwrap();

    scheduler.run_now(CLEANUP_TASK).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.count().await.unwrap() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "cleanup did not run");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    scheduler.shutdown().await;

    let stats = scheduler.stats();
    let cleanup = stats.iter().find(|s| s.name == CLEANUP_TASK).unwrap();
    assert_eq!(cleanup.runs, 1);
    assert!(stats.iter().any(|s| s.name == FLUSH_TASK));
    assert_eq!(manager.stats().deleted, 1);
}
