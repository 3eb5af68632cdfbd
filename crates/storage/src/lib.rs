//! Storage layer for ledgersync.
//!
//! This crate provides the stores the ingestion pipeline writes to, built on a
//! small byte-level [`StorageBackend`] trait:
//!
//! - [`DedupStore`]: one [`TransactionRecord`] per transaction id, written by
//!   both the block listener and the gateway submission path and merged on
//!   every upsert.
//! - [`CursorStore`]: the last block number the listener fully processed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Listener / Reconciliation coordinator / Gateway      │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │   DedupStore (merge on CAS)  │  CursorStore                 │
//! │   BackendDedupStore          │  BackendCursorStore          │
//! │                              │  FileCursorStore             │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │          StorageBackend (get, set, compare_and_set,         │
//! │                          get_range)                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      MemoryBackend                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use chrono::Utc;
//! use ledgersync_storage::{
//!     BackendDedupStore, DedupStore, MemoryBackend, RecordSource, TransactionRecord,
//!     ValidationStatus,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = BackendDedupStore::builder().backend(MemoryBackend::new()).build();
//!
//!     let submitted = TransactionRecord::builder()
//!         .tx_id("tx3")
//!         .status(ValidationStatus::Valid)
//!         .ingested_at(Utc::now())
//!         .source(RecordSource::Gateway)
//!         .build();
//!     store.upsert(submitted).await?;
//!
//!     let stored = store.get("tx3").await?;
//!     assert_eq!(stored.map(|r| r.status), Some(ValidationStatus::Valid));
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All operations return [`StorageResult<T>`]. Transient errors (see
//! [`StorageError::is_transient`]) are retried inside the stores per
//! [`RetryConfig`]; compare-and-set conflicts per [`CasRetryConfig`].
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with [`FailingBackend`](testutil::FailingBackend),
//!   record helpers and assertion macros.
//! - **`failpoints`**: Activates `fail` injection points on retry sleeps, dedup writes and cursor
//!   saves.

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod cursor;
pub mod dedup;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod record;
pub mod retry;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod types;

pub use backend::StorageBackend;
pub use config::{CasRetryConfig, RetryConfig};
pub use cursor::{BackendCursorStore, CursorStore, FileCursorStore};
pub use dedup::{BackendDedupStore, DedupStore, FlagOutcome, UpsertKind, UpsertOutcome};
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use record::{
    Merge, RecordSource, StatusChange, StatusConflict, TransactionRecord, ValidationStatus,
};
pub use types::KeyValue;
