//! Shared test utilities for store testing.
//!
//! Feature-gated behind `testutil` to keep it out of production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! ledgersync-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use ledgersync_storage::testutil::{FailingBackend, gateway_record};
//! ```

use std::{
    ops::RangeBounds,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
    record::{RecordSource, TransactionRecord, ValidationStatus},
    types::KeyValue,
};

/// Kind of error a [`FailingBackend`] injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// [`StorageError::Connection`], transient.
    Connection,
    /// [`StorageError::Timeout`], transient.
    Timeout,
    /// [`StorageError::Internal`], not transient.
    Internal,
}

impl InjectedFailure {
    fn to_error(self) -> StorageError {
        match self {
            Self::Connection => StorageError::connection("injected connection failure"),
            Self::Timeout => StorageError::timeout(),
            Self::Internal => StorageError::internal("injected internal failure"),
        }
    }
}

/// Sentinel for "fail every call".
const FAIL_FOREVER: u32 = u32::MAX;

/// A [`MemoryBackend`] wrapper that fails on demand.
///
/// Every operation first checks the failure plan: while failures remain, the
/// call returns the configured error without touching the data. Clones share
/// the plan and the data.
#[derive(Debug, Clone, Default)]
pub struct FailingBackend {
    inner: MemoryBackend,
    remaining: Arc<AtomicU32>,
    kind: Arc<Mutex<Option<InjectedFailure>>>,
    calls: Arc<AtomicU64>,
}

impl FailingBackend {
    /// Creates a healthy backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` operations with `kind`.
    pub fn fail_next(&self, count: u32, kind: InjectedFailure) {
        *self.kind.lock() = Some(kind);
        self.remaining.store(count, Ordering::SeqCst);
    }

    /// Fails every operation with `kind` until [`heal`](Self::heal) is called.
    pub fn fail_always(&self, kind: InjectedFailure) {
        self.fail_next(FAIL_FOREVER, kind);
    }

    /// Stops injecting failures.
    pub fn heal(&self) {
        self.remaining.store(0, Ordering::SeqCst);
        *self.kind.lock() = None;
    }

    /// Returns the number of operations attempted, failed or not.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn check(&self) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(kind) = *self.kind.lock() else {
            return Ok(());
        };
        let taken = self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
            0 => None,
            FAIL_FOREVER => Some(FAIL_FOREVER),
            n => Some(n - 1),
        });
        match taken {
            Ok(_) => Err(kind.to_error()),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.check()?;
        self.inner.compare_and_set(key, expected, new_value).await
    }

    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        self.check()?;
        self.inner.get_range(range).await
    }
}

/// Fixed reference time used by the record helpers.
#[must_use]
pub fn reference_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_767_225_600, 0).single().unwrap_or_default()
}

/// A gateway-sourced record with a fixed channel, function and arguments.
#[must_use]
pub fn gateway_record(tx_id: &str, status: ValidationStatus) -> TransactionRecord {
    TransactionRecord::builder()
        .tx_id(tx_id)
        .channel("mychannel")
        .chaincode("basic")
        .function("CreateAsset")
        .args(vec![tx_id.to_string()])
        .status(status)
        .ingested_at(reference_time())
        .source(RecordSource::Gateway)
        .build()
}

/// A listener-sourced record observed in `block`.
#[must_use]
pub fn listener_record(tx_id: &str, status: ValidationStatus, block: u64) -> TransactionRecord {
    TransactionRecord::builder()
        .tx_id(tx_id)
        .channel("mychannel")
        .chaincode("basic")
        .block_number(block)
        .status(status)
        .function("CreateAsset")
        .args(vec![tx_id.to_string()])
        .ledger_time(reference_time())
        .ingested_at(reference_time())
        .source(RecordSource::Listener)
        .build()
}

/// Assert that a [`StorageResult`] is a transient error.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use ledgersync_storage::{StorageError, StorageResult, assert_transient};
///
/// let result: StorageResult<()> = Err(StorageError::timeout());
/// assert_transient!(result);
/// ```
#[macro_export]
macro_rules! assert_transient {
    ($result:expr) => {
        match &$result {
            Err(err) if err.is_transient() => {},
            other => panic!("expected a transient StorageError, got: {:?}", other),
        }
    };
}

/// Assert that a [`StorageResult`] is [`StorageError::CasRetriesExhausted`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use ledgersync_storage::{StorageError, StorageResult, assert_cas_exhausted};
///
/// let result: StorageResult<()> = Err(StorageError::cas_retries_exhausted(3));
/// assert_cas_exhausted!(result);
/// ```
#[macro_export]
macro_rules! assert_cas_exhausted {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::CasRetriesExhausted { .. })),
            "expected StorageError::CasRetriesExhausted, got: {:?}",
            $result,
        );
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_backend_fails_then_heals() {
        let backend = FailingBackend::new();
        backend.fail_next(2, InjectedFailure::Timeout);

        assert_transient!(backend.get(b"k").await);
        assert_transient!(backend.set(b"k".to_vec(), b"v".to_vec()).await);
        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();

        assert_eq!(backend.calls(), 3);
        assert_eq!(backend.inner().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_backend_fail_always() {
        let backend = FailingBackend::new();
        backend.fail_always(InjectedFailure::Internal);
        for _ in 0..5 {
            assert!(backend.get(b"k").await.is_err());
        }
        backend.heal();
        assert!(backend.get(b"k").await.is_ok());
    }
}
