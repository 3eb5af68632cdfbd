#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p ledgersync-storage --features failpoints --test failpoint_tests
//! ```

use std::time::Duration;

use chrono::Utc;
use ledgersync_storage::{
    BackendCursorStore, BackendDedupStore, CursorStore, DedupStore, MemoryBackend, RecordSource,
    RetryConfig, StorageError, TransactionRecord, ValidationStatus,
};

fn gateway(tx_id: &str) -> TransactionRecord {
    TransactionRecord::builder()
        .tx_id(tx_id)
        .status(ValidationStatus::Valid)
        .ingested_at(Utc::now())
        .source(RecordSource::Gateway)
        .build()
}

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_retries(max_retries)
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(2))
        .build()
        .expect("valid retry config")
}

#[tokio::test]
async fn upsert_failpoint_exhausts_transient_retries() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("dedup-upsert-before-write", "return").expect("failed to configure fail point");

    let store =
        BackendDedupStore::builder().backend(MemoryBackend::new()).retry(fast_retry(2)).build();
    let result = store.upsert(gateway("tx1")).await;

    assert!(matches!(result, Err(StorageError::Connection { .. })), "got: {result:?}");
    let snapshot = store.metrics().snapshot();
    assert_eq!(snapshot.retry_count, 2);
    assert_eq!(snapshot.retry_exhausted_count, 1);
    assert!(store.backend().is_empty());

    scenario.teardown();
}

#[tokio::test]
async fn upsert_failpoint_recovers_within_retry_budget() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("dedup-upsert-before-write", "2*return").expect("failed to configure fail point");

    let store =
        BackendDedupStore::builder().backend(MemoryBackend::new()).retry(fast_retry(3)).build();
    store.upsert(gateway("tx1")).await.expect("third attempt should succeed");

    assert!(store.get("tx1").await.expect("get").is_some());
    assert_eq!(store.metrics().snapshot().retry_count, 2);

    scenario.teardown();
}

#[tokio::test]
async fn cursor_save_failpoint_leaves_cursor_untouched() {
    let scenario = fail::FailScenario::setup();
    let store = BackendCursorStore::builder().backend(MemoryBackend::new()).build();
    store.save(4).await.expect("save without fail point");

    fail::cfg("cursor-save", "return").expect("failed to configure fail point");
    assert!(store.save(5).await.is_err());
    fail::remove("cursor-save");

    assert_eq!(store.load().await.expect("load"), Some(4));

    scenario.teardown();
}
