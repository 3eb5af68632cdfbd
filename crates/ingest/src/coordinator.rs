//! Reconciliation of listener observations with gateway submissions.
//!
//! Both write paths funnel into one [`DedupStore`]. The store merges every
//! upsert into the existing record (see [`TransactionRecord::merge`]); the
//! [`Coordinator`] adds what the store cannot see on its own:
//!
//! - **Per-id serialization.** Each upsert runs under the transaction id's
//!   key lock, so concurrent writers of one id queue up in-process instead of
//!   burning compare-and-set retries. Different ids never wait on each other.
//! - **Missing-commit detection.** A gateway submission the listener has not
//!   seen yet is tracked as *pending* with a deadline. Once the deadline
//!   passes, [`sweep_unconfirmed`](Coordinator::sweep_unconfirmed) raises the
//!   advisory `unconfirmed` flag. A later listener observation clears it.
//!   Gateway records written straight to the store are picked up by
//!   [`recover_pending`](Coordinator::recover_pending), which the sweeper
//!   runs before every sweep.
//!
//! ```text
//!  gateway ──accept_gateway──┐                 ┌── pending (deadline)
//!                            ├─► key lock ─► DedupStore::upsert
//!  listener ──accept_block───┘                 └── confirms pending ids
//!
//!  sweeper ──recover_pending───► DedupStore::list (untracked gateway records)
//!          └─sweep_unconfirmed──► DedupStore::flag_unconfirmed (expired ids)
//! ```

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use ledgersync_storage::{
    DedupStore, FlagOutcome, StorageResult, TransactionRecord, UpsertKind, UpsertOutcome,
};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ReconcileConfig,
    decoder::TransactionCandidate,
    error::ReconcileError,
    key_lock::KeyLocks,
    observer::{NoopObserver, PipelineEvent, PipelineObserver},
};

/// What [`Coordinator::accept_block`] did with a block's transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockReceipt {
    /// Transactions seen for the first time.
    pub inserted: usize,
    /// Transactions merged into an existing record.
    pub merged: usize,
    /// Transactions already stored exactly as observed.
    pub unchanged: usize,
    /// Pending gateway submissions this block confirmed.
    pub confirmed_pending: usize,
}

impl BlockReceipt {
    /// Returns the number of transactions in the block.
    #[must_use]
    pub fn transactions(&self) -> usize {
        self.inserted + self.merged + self.unchanged
    }

    fn count(&mut self, kind: UpsertKind) {
        match kind {
            UpsertKind::Inserted => self.inserted += 1,
            UpsertKind::Merged => self.merged += 1,
            UpsertKind::Unchanged => self.unchanged += 1,
        }
    }
}

/// Merges listener and gateway writes and detects missing commits.
///
/// Shared as `Arc<Coordinator<S>>` between the listener task, gateway request
/// handlers and the sweeper.
pub struct Coordinator<S> {
    store: S,
    locks: KeyLocks,
    pending: Mutex<HashMap<String, Instant>>,
    config: ReconcileConfig,
    observer: Arc<dyn PipelineObserver>,
}

impl<S> std::fmt::Debug for Coordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("pending", &self.pending.lock().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl<S: DedupStore> Coordinator<S> {
    /// Creates a coordinator over `store`.
    #[builder]
    pub fn new(
        store: S,
        #[builder(default)] config: ReconcileConfig,
        #[builder(default = Arc::new(NoopObserver) as Arc<dyn PipelineObserver>)]
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self { store, locks: KeyLocks::new(), pending: Mutex::new(HashMap::new()), config, observer }
    }
}

impl<S: DedupStore> Coordinator<S> {
    /// Stores the transactions of one block, in block order.
    ///
    /// Every candidate is stamped with the current time as its ingestion time
    /// and upserted under its id's key lock. Pending gateway submissions found
    /// in the block are confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] for the first transaction the store rejects
    /// after its retries. Transactions before it stay stored; the block as a
    /// whole is not accepted and must be delivered again.
    #[tracing::instrument(skip(self, candidates), fields(transactions = candidates.len()))]
    pub async fn accept_block(
        &self,
        block_number: u64,
        candidates: Vec<TransactionCandidate>,
    ) -> Result<BlockReceipt, ReconcileError> {
        let ingested_at = Utc::now();
        let mut receipt = BlockReceipt::default();

        for candidate in candidates {
            let tx_id = candidate.tx_id.clone();
            let outcome = {
                let _guard = self.locks.lock(&tx_id).await;
                self.store
                    .upsert(candidate.into_record(ingested_at))
                    .await
                    .map_err(|source| ReconcileError { tx_id: tx_id.clone(), source })?
            };

            receipt.count(outcome.kind);
            if self.pending.lock().remove(&tx_id).is_some() {
                receipt.confirmed_pending += 1;
            }
            self.report(&outcome);
        }

        Ok(receipt)
    }

    /// Stores a record submitted through the gateway.
    ///
    /// If the listener has not observed the transaction yet, it becomes
    /// pending and is flagged unconfirmed by the first sweep after the
    /// unconfirmed window elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] if the store rejects the write.
    #[tracing::instrument(skip(self, record), fields(tx_id = %record.tx_id))]
    pub async fn accept_gateway(
        &self,
        record: TransactionRecord,
    ) -> Result<UpsertOutcome, ReconcileError> {
        let tx_id = record.tx_id.clone();
        let guard = self.locks.lock(&tx_id).await;
        let outcome = self
            .store
            .upsert(record)
            .await
            .map_err(|source| ReconcileError { tx_id: tx_id.clone(), source })?;

        // Registered under the key lock so a concurrent block cannot confirm
        // the id in between.
        let pending = !outcome.record.is_observed_by_listener() && !outcome.record.unconfirmed;
        if pending {
            let deadline = Instant::now() + self.config.unconfirmed_window;
            self.pending.lock().entry(tx_id.clone()).or_insert(deadline);
        }
        drop(guard);

        self.report(&outcome);
        self.observer.observe(&PipelineEvent::GatewayAccepted { tx_id, pending });
        Ok(outcome)
    }

    /// Flags every pending submission whose deadline has passed.
    ///
    /// Returns the ids newly flagged. Ids the listener observed in the
    /// meantime are dropped from the tracker without being flagged.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] if the store fails. The failed id and every
    /// id not yet processed stay pending for the next sweep.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_unconfirmed(&self) -> Result<Vec<String>, ReconcileError> {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(tx_id, _)| tx_id.clone())
                .collect();
            for tx_id in &ids {
                pending.remove(tx_id);
            }
            ids
        };

        let mut flagged = Vec::new();
        let mut remaining = expired.into_iter();
        while let Some(tx_id) = remaining.next() {
            let result = {
                let _guard = self.locks.lock(&tx_id).await;
                self.store.flag_unconfirmed(&tx_id).await
            };

            match result {
                Ok(FlagOutcome::Flagged) => {
                    self.observer.observe(&PipelineEvent::Unconfirmed { tx_id: tx_id.clone() });
                    flagged.push(tx_id);
                },
                Ok(FlagOutcome::AlreadyFlagged | FlagOutcome::AlreadyObserved) => {},
                Ok(FlagOutcome::NotFound) => {
                    tracing::warn!(tx_id = %tx_id, "pending submission missing from store");
                },
                Err(source) => {
                    let mut pending = self.pending.lock();
                    pending.entry(tx_id.clone()).or_insert(now);
                    for rest in remaining {
                        pending.entry(rest).or_insert(now);
                    }
                    return Err(ReconcileError { tx_id, source });
                },
            }
        }

        Ok(flagged)
    }

    /// Registers stored gateway submissions the tracker does not know yet.
    ///
    /// Covers records written straight to the store instead of through
    /// [`accept_gateway`](Self::accept_gateway), and rebuilds the tracker
    /// after a restart. Every record the listener has not observed and that
    /// is not already flagged is tracked with a deadline of `ingested_at +
    /// unconfirmed_window`; ids already pending keep their deadline. Returns
    /// the number of ids registered.
    ///
    /// The sweeper calls this before every sweep.
    ///
    /// # Errors
    ///
    /// Returns the store error if the records cannot be listed.
    pub async fn recover_pending(&self) -> StorageResult<usize> {
        let records = self.store.list().await?;
        let now = Instant::now();
        let wall_now = Utc::now();

        let mut pending = self.pending.lock();
        let before = pending.len();
        for record in records {
            if record.is_observed_by_listener() || record.unconfirmed {
                continue;
            }
            let age = (wall_now - record.ingested_at).to_std().unwrap_or_default();
            let remaining = self.config.unconfirmed_window.saturating_sub(age);
            pending.entry(record.tx_id).or_insert(now + remaining);
        }
        let recovered = pending.len() - before;
        drop(pending);

        if recovered > 0 {
            tracing::info!(recovered, "tracking stored gateway submissions");
        }
        Ok(recovered)
    }

    /// Reads the stored record for `tx_id`.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn get(&self, tx_id: &str) -> StorageResult<Option<TransactionRecord>> {
        self.store.get(tx_id).await
    }

    /// Returns the number of submissions awaiting listener observation.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns the reconciliation settings.
    #[must_use]
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    fn report(&self, outcome: &UpsertOutcome) {
        let tx_id = &outcome.record.tx_id;
        if let Some(conflict) = outcome.status_conflict {
            self.observer.observe(&PipelineEvent::StatusConflict { tx_id: tx_id.clone(), conflict });
        }
        if outcome.cleared_unconfirmed {
            self.observer.observe(&PipelineEvent::UnconfirmedCleared {
                tx_id: tx_id.clone(),
                block: outcome.record.block_number,
            });
        }
    }
}

impl<S: DedupStore + 'static> Coordinator<S> {
    /// Runs [`recover_pending`](Self::recover_pending) and then
    /// [`sweep_unconfirmed`](Self::sweep_unconfirmed) every `sweep_interval`
    /// until `token` is cancelled.
    ///
    /// A sweep in progress finishes before the task exits. Sweep failures are
    /// logged and retried on the next tick.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::info!("unconfirmed sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = coordinator.recover_pending().await {
                            tracing::warn!(error = %err, "pending submission scan failed");
                        }
                        if let Err(err) = coordinator.sweep_unconfirmed().await {
                            tracing::warn!(tx_id = %err.tx_id, error = %err.source, "unconfirmed sweep failed");
                        }
                    }
                }
            }
        })
    }
}
