//! Idempotent transaction persistence.
//!
//! The [`DedupStore`] trait is the one place both write paths meet. Every
//! write is an upsert keyed by transaction id; [`BackendDedupStore`]
//! implements it as a read-merge-compare-and-set cycle over any
//! [`StorageBackend`], so at most one record exists per id no matter how the
//! listener and gateway writes interleave, across tasks or processes.
//!
//! # Key Layout
//!
//! Records are stored as JSON under `tx/{tx_id}`.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;

use crate::{
    backend::{StorageBackend, prefix_end},
    config::{CasRetryConfig, RetryConfig},
    error::{StorageError, StorageResult},
    metrics::StoreMetrics,
    record::{StatusConflict, TransactionRecord},
    retry::{with_cas_retry, with_retry},
};

/// Key prefix for transaction records.
pub const RECORD_KEY_PREFIX: &str = "tx/";

/// What an upsert did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    /// No record existed; the incoming record was stored.
    Inserted,
    /// An existing record was merged and rewritten.
    Merged,
    /// The merge changed nothing; nothing was written.
    Unchanged,
}

/// Result of [`DedupStore::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// What happened.
    pub kind: UpsertKind,
    /// The record as stored after the upsert.
    pub record: TransactionRecord,
    /// Set when the incoming status contradicted a stored terminal status.
    pub status_conflict: Option<StatusConflict>,
    /// Whether this upsert cleared the unconfirmed flag.
    pub cleared_unconfirmed: bool,
}

/// Result of [`DedupStore::flag_unconfirmed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOutcome {
    /// The flag was raised.
    Flagged,
    /// The flag was already raised.
    AlreadyFlagged,
    /// The listener has seen the id; the flag was not raised.
    AlreadyObserved,
    /// No record exists for the id.
    NotFound,
}

/// Idempotent store of transaction records keyed by transaction id.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Inserts `record` or merges it into the stored record with the same id.
    ///
    /// See [`TransactionRecord::merge`] for the merge rules.
    async fn upsert(&self, record: TransactionRecord) -> StorageResult<UpsertOutcome>;

    /// Reads the record for `tx_id`.
    async fn get(&self, tx_id: &str) -> StorageResult<Option<TransactionRecord>>;

    /// Raises the advisory unconfirmed flag on `tx_id`.
    ///
    /// Records already observed by the listener are left untouched.
    async fn flag_unconfirmed(&self, tx_id: &str) -> StorageResult<FlagOutcome>;

    /// Returns every stored record, ordered by id.
    async fn list(&self) -> StorageResult<Vec<TransactionRecord>>;
}

#[async_trait]
impl<S: DedupStore + ?Sized> DedupStore for Arc<S> {
    async fn upsert(&self, record: TransactionRecord) -> StorageResult<UpsertOutcome> {
        (**self).upsert(record).await
    }

    async fn get(&self, tx_id: &str) -> StorageResult<Option<TransactionRecord>> {
        (**self).get(tx_id).await
    }

    async fn flag_unconfirmed(&self, tx_id: &str) -> StorageResult<FlagOutcome> {
        (**self).flag_unconfirmed(tx_id).await
    }

    async fn list(&self) -> StorageResult<Vec<TransactionRecord>> {
        (**self).list().await
    }
}

/// [`DedupStore`] over a byte-level [`StorageBackend`].
///
/// Each write reads the stored bytes, merges in memory and writes back with
/// a compare-and-set conditioned on the bytes it read. Conflicts are retried
/// per [`CasRetryConfig`]; transient backend failures per [`RetryConfig`].
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use ledgersync_storage::{
///     BackendDedupStore, DedupStore, MemoryBackend, RecordSource, TransactionRecord, UpsertKind,
///     ValidationStatus,
/// };
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = BackendDedupStore::builder().backend(MemoryBackend::new()).build();
///
/// let record = TransactionRecord::builder()
///     .tx_id("tx1")
///     .status(ValidationStatus::Valid)
///     .ingested_at(Utc::now())
///     .source(RecordSource::Gateway)
///     .build();
///
/// assert_eq!(store.upsert(record.clone()).await.unwrap().kind, UpsertKind::Inserted);
/// assert_eq!(store.upsert(record).await.unwrap().kind, UpsertKind::Unchanged);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct BackendDedupStore<B> {
    backend: B,
    retry: RetryConfig,
    cas_retry: CasRetryConfig,
    metrics: StoreMetrics,
}

#[bon::bon]
impl<B: StorageBackend> BackendDedupStore<B> {
    /// Creates a store over `backend`.
    #[builder]
    pub fn new(
        backend: B,
        #[builder(default)] retry: RetryConfig,
        #[builder(default)] cas_retry: CasRetryConfig,
        #[builder(default)] metrics: StoreMetrics,
    ) -> Self {
        Self { backend, retry, cas_retry, metrics }
    }
}

impl<B: StorageBackend> BackendDedupStore<B> {
    /// Returns the store's metrics.
    #[must_use]
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Returns the underlying backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn record_key(tx_id: &str) -> Vec<u8> {
        format!("{RECORD_KEY_PREFIX}{tx_id}").into_bytes()
    }

    async fn read(&self, key: &[u8]) -> StorageResult<Option<(Bytes, TransactionRecord)>> {
        match self.backend.get(key).await? {
            Some(bytes) => {
                let record = decode(&bytes)?;
                Ok(Some((bytes, record)))
            },
            None => Ok(None),
        }
    }

    async fn try_upsert(
        &self,
        key: &[u8],
        incoming: &TransactionRecord,
    ) -> StorageResult<UpsertOutcome> {
        fail_point!("dedup-upsert-before-write", |_| {
            Err(StorageError::connection("injected upsert failure"))
        });

        let Some((bytes, stored)) = self.read(key).await? else {
            self.backend.compare_and_set(key, None, encode(incoming)?).await?;
            return Ok(UpsertOutcome {
                kind: UpsertKind::Inserted,
                record: incoming.clone(),
                status_conflict: None,
                cleared_unconfirmed: false,
            });
        };

        let merge = stored.merge(incoming);
        let kind = if merge.changed {
            self.backend.compare_and_set(key, Some(&bytes), encode(&merge.record)?).await?;
            UpsertKind::Merged
        } else {
            UpsertKind::Unchanged
        };

        Ok(UpsertOutcome {
            kind,
            record: merge.record,
            status_conflict: merge.status_conflict,
            cleared_unconfirmed: merge.cleared_unconfirmed,
        })
    }

    async fn try_flag(&self, key: &[u8]) -> StorageResult<FlagOutcome> {
        let Some((bytes, mut record)) = self.read(key).await? else {
            return Ok(FlagOutcome::NotFound);
        };
        if record.is_observed_by_listener() {
            return Ok(FlagOutcome::AlreadyObserved);
        }
        if record.unconfirmed {
            return Ok(FlagOutcome::AlreadyFlagged);
        }

        record.unconfirmed = true;
        self.backend.compare_and_set(key, Some(&bytes), encode(&record)?).await?;
        Ok(FlagOutcome::Flagged)
    }

    fn observe_error<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if let Err(err) = &result {
            self.metrics.record_error();
            tracing::warn!(error = %err, "dedup store operation failed");
        }
        result
    }
}

#[async_trait]
impl<B: StorageBackend> DedupStore for BackendDedupStore<B> {
    #[tracing::instrument(skip(self, record), fields(tx_id = %record.tx_id, source = %record.source))]
    async fn upsert(&self, record: TransactionRecord) -> StorageResult<UpsertOutcome> {
        if record.tx_id.is_empty() {
            return self.observe_error(Err(StorageError::internal(
                "transaction id must not be empty",
            )));
        }

        let start = Instant::now();
        let key = Self::record_key(&record.tx_id);
        let metrics = Some(&self.metrics);

        let result = with_retry(&self.retry, metrics, "dedup_upsert", || {
            with_cas_retry(&self.cas_retry, metrics, || self.try_upsert(&key, &record))
        })
        .await;

        if let Ok(outcome) = &result {
            self.metrics.record_upsert(start.elapsed());
            match outcome.kind {
                UpsertKind::Inserted => self.metrics.record_inserted(),
                UpsertKind::Merged => self.metrics.record_merged(),
                UpsertKind::Unchanged => self.metrics.record_unchanged(),
            }
            if let Some(conflict) = &outcome.status_conflict {
                self.metrics.record_status_conflict();
                tracing::warn!(
                    tx_id = %record.tx_id,
                    stored = %conflict.stored,
                    incoming = %conflict.incoming,
                    incoming_source = %conflict.incoming_source,
                    "contradictory terminal status, keeping stored value",
                );
            }
            tracing::debug!(kind = ?outcome.kind, "upsert complete");
        }

        self.observe_error(result)
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, tx_id: &str) -> StorageResult<Option<TransactionRecord>> {
        let key = Self::record_key(tx_id);
        let result: StorageResult<Option<TransactionRecord>> =
            with_retry(&self.retry, Some(&self.metrics), "dedup_get", || async {
                Ok(self.read(&key).await?.map(|(_, record)| record))
            })
            .await;
        self.observe_error(result)
    }

    #[tracing::instrument(skip(self))]
    async fn flag_unconfirmed(&self, tx_id: &str) -> StorageResult<FlagOutcome> {
        let key = Self::record_key(tx_id);
        let metrics = Some(&self.metrics);

        let result = with_retry(&self.retry, metrics, "dedup_flag_unconfirmed", || {
            with_cas_retry(&self.cas_retry, metrics, || self.try_flag(&key))
        })
        .await;

        if let Ok(FlagOutcome::Flagged) = result {
            self.metrics.record_flagged();
        }
        self.observe_error(result)
    }

    #[tracing::instrument(skip(self))]
    async fn list(&self) -> StorageResult<Vec<TransactionRecord>> {
        let start = RECORD_KEY_PREFIX.as_bytes().to_vec();
        let end = prefix_end(&start);

        let result: StorageResult<Vec<TransactionRecord>> =
            with_retry(&self.retry, Some(&self.metrics), "dedup_list", || async {
                let entries = match &end {
                    Some(end) => self.backend.get_range(start.clone()..end.clone()).await?,
                    None => self.backend.get_range(start.clone()..).await?,
                };
                entries.iter().map(|kv| decode(&kv.value)).collect()
            })
            .await;
        self.observe_error(result)
    }
}

fn encode(record: &TransactionRecord) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(record)
        .map_err(|e| StorageError::serialization_with_source("failed to encode record", e))
}

fn decode(bytes: &[u8]) -> StorageResult<TransactionRecord> {
    serde_json::from_slice(bytes)
        .map_err(|e| StorageError::serialization_with_source("failed to decode record", e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        memory::MemoryBackend,
        record::{RecordSource, ValidationStatus},
    };

    fn store() -> BackendDedupStore<MemoryBackend> {
        BackendDedupStore::builder().backend(MemoryBackend::new()).build()
    }

    fn record(tx_id: &str, source: RecordSource, status: ValidationStatus) -> TransactionRecord {
        TransactionRecord::builder()
            .tx_id(tx_id)
            .channel("mychannel")
            .status(status)
            .ingested_at(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap())
            .source(source)
            .build()
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_merges_into_one_record() {
        let store = store();

        let first = store
            .upsert(record("tx3", RecordSource::Gateway, ValidationStatus::Valid))
            .await
            .unwrap();
        assert_eq!(first.kind, UpsertKind::Inserted);

        let mut late = record("tx3", RecordSource::Listener, ValidationStatus::Valid);
        late.block_number = Some(9);
        let second = store.upsert(late).await.unwrap();
        assert_eq!(second.kind, UpsertKind::Merged);

        let stored = store.get("tx3").await.unwrap().unwrap();
        assert_eq!(stored.block_number, Some(9));
        assert_eq!(stored.source, RecordSource::Listener);
        assert_eq!(store.list().await.unwrap().len(), 1);

        let snapshot = store.metrics().snapshot();
        assert_eq!(snapshot.inserted_count, 1);
        assert_eq!(snapshot.merged_count, 1);
    }

    #[tokio::test]
    async fn test_unchanged_upsert_writes_nothing() {
        let store = store();
        let r = record("tx1", RecordSource::Listener, ValidationStatus::Valid);
        store.upsert(r.clone()).await.unwrap();
        let before = store.backend().get(b"tx/tx1").await.unwrap();

        let outcome = store.upsert(r).await.unwrap();

        assert_eq!(outcome.kind, UpsertKind::Unchanged);
        assert_eq!(store.backend().get(b"tx/tx1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_status_conflict_is_reported_and_counted() {
        let store = store();
        store.upsert(record("tx1", RecordSource::Gateway, ValidationStatus::Valid)).await.unwrap();

        let outcome = store
            .upsert(record("tx1", RecordSource::Listener, ValidationStatus::Invalid))
            .await
            .unwrap();

        assert_eq!(outcome.record.status, ValidationStatus::Valid);
        assert!(outcome.status_conflict.is_some());
        assert_eq!(store.metrics().snapshot().status_conflict_count, 1);
    }

    #[tokio::test]
    async fn test_flag_unconfirmed_outcomes() {
        let store = store();
        assert_eq!(store.flag_unconfirmed("missing").await.unwrap(), FlagOutcome::NotFound);

        store.upsert(record("tx4", RecordSource::Gateway, ValidationStatus::Valid)).await.unwrap();
        assert_eq!(store.flag_unconfirmed("tx4").await.unwrap(), FlagOutcome::Flagged);
        assert_eq!(store.flag_unconfirmed("tx4").await.unwrap(), FlagOutcome::AlreadyFlagged);
        assert!(store.get("tx4").await.unwrap().unwrap().unconfirmed);

        store.upsert(record("tx5", RecordSource::Listener, ValidationStatus::Valid)).await.unwrap();
        assert_eq!(store.flag_unconfirmed("tx5").await.unwrap(), FlagOutcome::AlreadyObserved);
    }

    #[tokio::test]
    async fn test_list_ignores_other_prefixes() {
        let store = store();
        store.backend().set(b"cursor/main".to_vec(), b"41".to_vec()).await.unwrap();
        store.upsert(record("b", RecordSource::Gateway, ValidationStatus::Unknown)).await.unwrap();
        store.upsert(record("a", RecordSource::Gateway, ValidationStatus::Unknown)).await.unwrap();

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.tx_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_id_rejected() {
        let store = store();
        let result = store.upsert(record("", RecordSource::Gateway, ValidationStatus::Valid)).await;
        assert!(matches!(result, Err(StorageError::Internal { .. })));
        assert_eq!(store.metrics().snapshot().error_count, 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_surfaces_serialization_error() {
        let store = store();
        store.backend().set(b"tx/bad".to_vec(), b"not json".to_vec()).await.unwrap();

        let result = store.get("bad").await;
        assert!(matches!(result, Err(StorageError::Serialization { .. })));
    }
}
