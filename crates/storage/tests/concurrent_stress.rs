//! Concurrent access stress tests for `BackendDedupStore`.
//!
//! These tests race listener and gateway writers against the same ids on a
//! multi-threaded runtime and check that every id converges to exactly one
//! record with a monotonic status.

#![allow(clippy::expect_used, clippy::panic)]

use std::{collections::BTreeSet, time::Duration};

use chrono::{TimeZone, Utc};
use ledgersync_storage::{
    BackendDedupStore, CasRetryConfig, DedupStore, MemoryBackend, RecordSource, StorageBackend,
    TransactionRecord, ValidationStatus,
};
use tokio::task::JoinSet;

/// Number of concurrent writer tasks.
const CONCURRENCY: usize = 16;

/// Number of distinct transaction ids.
const IDS: usize = 8;

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

fn contended_store() -> BackendDedupStore<MemoryBackend> {
    BackendDedupStore::builder()
        .backend(MemoryBackend::new())
        .cas_retry(
            CasRetryConfig::builder().max_retries(200).base_delay(Duration::from_millis(1)).build(),
        )
        .build()
}

fn record_for(task: usize, id: usize) -> TransactionRecord {
    let source = if task % 2 == 0 { RecordSource::Listener } else { RecordSource::Gateway };
    let status = if task % 3 == 0 { ValidationStatus::Unknown } else { ValidationStatus::Valid };
    let builder = TransactionRecord::builder()
        .tx_id(format!("tx{id}"))
        .channel("mychannel")
        .status(status)
        .ingested_at(Utc.timestamp_opt(1_767_225_600 + task as i64, 0).single().expect("time"))
        .source(source);
    match source {
        RecordSource::Listener => builder.block_number(id as u64).build(),
        RecordSource::Gateway => builder.build(),
    }
}

// ---------------------------------------------------------------------------
// Test: any interleaving of both sources leaves one record per id
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_sources_converge_to_one_record_per_id() {
    let store = contended_store();

    let mut set = JoinSet::new();
    for task in 0..CONCURRENCY {
        let store = store.clone();
        set.spawn(async move {
            for id in 0..IDS {
                store.upsert(record_for(task, id)).await.expect("upsert should succeed");
            }
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    let records = store.list().await.expect("list should succeed");
    assert_eq!(records.len(), IDS, "expected exactly one record per id");
    assert_eq!(store.backend().len(), IDS);

    for record in records {
        assert_eq!(record.status, ValidationStatus::Valid, "{} regressed", record.tx_id);
        assert_eq!(
            record.observed_by,
            BTreeSet::from([RecordSource::Listener, RecordSource::Gateway])
        );
        assert!(record.block_number.is_some(), "{} lost its block number", record.tx_id);
        assert_eq!(record.ingested_at, Utc.timestamp_opt(1_767_225_600, 0).single().expect("t"));
    }

    let snapshot = store.metrics().snapshot();
    assert_eq!(snapshot.inserted_count, IDS as u64);
    assert_eq!(snapshot.upsert_count, (CONCURRENCY * IDS) as u64);
}

// ---------------------------------------------------------------------------
// Test: contention on a single id never loses the terminal status
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_id_contention_keeps_first_terminal_status() {
    let store = contended_store();

    let mut set = JoinSet::new();
    for task in 0..CONCURRENCY {
        let store = store.clone();
        set.spawn(async move {
            let status = match task % 3 {
                0 => ValidationStatus::Unknown,
                1 => ValidationStatus::Valid,
                _ => ValidationStatus::Invalid,
            };
            let record = TransactionRecord::builder()
                .tx_id("hot")
                .status(status)
                .ingested_at(Utc.timestamp_opt(1_767_225_600, 0).single().expect("time"))
                .source(RecordSource::Gateway)
                .build();
            store.upsert(record).await.expect("upsert should succeed")
        });
    }

    let mut outcomes = Vec::new();
    while let Some(result) = set.join_next().await {
        outcomes.push(result.expect("task should not panic"));
    }

    let stored = store.get("hot").await.expect("get").expect("record should exist");
    assert!(stored.status.is_terminal());
    let terminal_changes = stored.history.iter().filter(|c| c.status.is_terminal()).count();
    assert_eq!(terminal_changes, 1, "history: {:?}", stored.history);

    // Every writer carrying the losing terminal status got a conflict report.
    let losers = (0..CONCURRENCY).filter(|task| task % 3 != 0).count() / 2;
    let conflicts = outcomes.iter().filter(|o| o.status_conflict.is_some()).count();
    assert_eq!(conflicts, losers);
    assert!(outcomes.iter().all(|o| o.record.status == stored.status || !o.record.status.is_terminal()));
}
