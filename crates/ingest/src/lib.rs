//! Ledger block ingestion for ledgersync.
//!
//! This crate keeps a local, deduplicated record of every transaction
//! committed on a ledger channel and reconciles it with the transactions the
//! application submitted through its gateway.
//!
//! # Architecture
//!
//! ```text
//!   LedgerStream ──► Listener ──► decode_block ──► Coordinator ──► DedupStore
//!   (subscribe)      (state           (pure)        (key locks,       ▲
//!                     machine)                       pending)         │
//!                        │                              ▲             │
//!                        ▼                              │             │
//!                   CursorStore               gateway submissions ────┘
//!
//!   PipelineObserver ◄── every component (TracingObserver, Metrics, ...)
//! ```
//!
//! - [`Listener`] subscribes from the persisted cursor, processes blocks in
//!   order and backs off on failure.
//! - [`decode_block`] extracts transaction candidates and their validation
//!   status from a block.
//! - [`Coordinator`] upserts listener and gateway observations under per-id
//!   locks and flags gateway submissions that never show up in a block.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ledgersync_ingest::{
//!     Coordinator, LedgerStream, Listener, ListenerConfig, TracingObserver,
//! };
//! use ledgersync_storage::{BackendDedupStore, FileCursorStore, MemoryBackend};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run(
//!     ledger: impl LedgerStream + 'static,
//!     stop: impl std::future::Future<Output = ()>,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let token = CancellationToken::new();
//!     let coordinator = Arc::new(
//!         Coordinator::builder()
//!             .store(BackendDedupStore::builder().backend(MemoryBackend::new()).build())
//!             .observer(Arc::new(TracingObserver))
//!             .build(),
//!     );
//!     let sweeper = coordinator.spawn_sweeper(token.clone());
//!
//!     let listener = Listener::builder()
//!         .stream(ledger)
//!         .cursor(FileCursorStore::new("/var/lib/ledgersync/cursor"))
//!         .coordinator(Arc::clone(&coordinator))
//!         .config(ListenerConfig::builder().channel("mychannel").build()?)
//!         .observer(Arc::new(TracingObserver))
//!         .token(token.clone())
//!         .build()?
//!         .spawn();
//!
//!     stop.await;
//!     listener.shutdown().await?;
//!     sweeper.await?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with
//!   [`BlockBuilder`](testutil::BlockBuilder),
//!   [`MockLedgerStream`](testutil::MockLedgerStream) and
//!   [`RecordingObserver`](testutil::RecordingObserver).

#![deny(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod key_lock;
pub mod listener;
pub mod metrics;
pub mod observer;
pub mod proto;
pub mod stream;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;

pub use config::{BackoffConfig, ListenerConfig, PipelineConfig, ReconcileConfig};
pub use coordinator::{BlockReceipt, Coordinator};
pub use decoder::{DecodedBlock, TransactionCandidate, decode_block};
pub use error::{DecodeError, ListenerError, ReconcileError, StreamError};
pub use key_lock::{KeyGuard, KeyLocks};
pub use listener::{Listener, ListenerHandle, ListenerState};
pub use metrics::{Metrics, MetricsSnapshot};
pub use observer::{NoopObserver, ObserverSet, PipelineEvent, PipelineObserver, TracingObserver};
pub use stream::{BlockEvent, BlockStream, LedgerStream};
