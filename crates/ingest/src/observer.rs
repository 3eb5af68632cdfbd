//! Observability hooks for the ingestion pipeline.
//!
//! The listener and the coordinator report everything an operator may need to
//! see as a [`PipelineEvent`] to a [`PipelineObserver`]:
//!
//! - [`TracingObserver`]: emits one structured `tracing` event per pipeline
//!   event, suitable for log aggregation.
//! - [`Metrics`](crate::Metrics): counts events.
//! - [`ObserverSet`]: fans out to several observers.
//! - [`NoopObserver`]: discards everything.
//!
//! Observers are called inline on the pipeline's tasks and must not block.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use ledgersync_ingest::{Metrics, ObserverSet, PipelineEvent, PipelineObserver, TracingObserver};
//!
//! let metrics = Arc::new(Metrics::new());
//! let observer = ObserverSet::new().with(TracingObserver).with(Arc::clone(&metrics));
//!
//! observer.observe(&PipelineEvent::Unconfirmed { tx_id: "tx4".into() });
//! assert_eq!(metrics.snapshot().unconfirmed_flagged, 1);
//! ```

use std::{sync::Arc, time::Duration};

use ledgersync_storage::StatusConflict;

use crate::{
    coordinator::BlockReceipt,
    error::{DecodeError, StreamError},
    listener::ListenerState,
};

/// Something that happened in the pipeline.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum PipelineEvent {
    /// The listener moved between states.
    StateChanged {
        /// Previous state.
        from: ListenerState,
        /// New state.
        to: ListenerState,
    },

    /// A subscription was opened.
    Subscribed {
        /// First block requested.
        start_block: u64,
    },

    /// A subscription attempt failed.
    SubscribeFailed {
        /// First block requested.
        start_block: u64,
        /// Why it failed.
        error: StreamError,
    },

    /// The listener could not read its cursor.
    CursorLoadFailed {
        /// The store failure.
        error: String,
    },

    /// The listener is waiting before resubscribing.
    BackingOff {
        /// Consecutive failures so far, starting at 1.
        attempt: u32,
        /// How long it waits.
        delay: Duration,
    },

    /// A block was accepted and the cursor advanced to it.
    BlockProcessed {
        /// Block number.
        block: u64,
        /// What the coordinator did with the block's transactions.
        receipt: BlockReceipt,
        /// Envelopes that were not endorser transactions.
        skipped: usize,
    },

    /// A block was delivered again and ignored.
    BlockRedelivered {
        /// Block number.
        block: u64,
        /// The next block the listener expects.
        expected: u64,
    },

    /// A block arrived ahead of the next expected block.
    BlockGap {
        /// Block number.
        block: u64,
        /// The next block the listener expects.
        expected: u64,
    },

    /// A block could not be decoded; the cursor still advances past it.
    DecodeFailed {
        /// Block number.
        block: u64,
        /// Why decoding failed.
        error: DecodeError,
    },

    /// A block could not be stored; it will be redelivered after resubscribing.
    BlockRejected {
        /// Block number.
        block: u64,
        /// The store failure.
        error: String,
    },

    /// The ledger closed the subscription.
    StreamEnded {
        /// The next block the listener expects.
        next_block: u64,
    },

    /// The subscription broke.
    StreamFailed {
        /// The next block the listener expects.
        next_block: u64,
        /// Why it broke.
        error: StreamError,
    },

    /// A gateway submission was stored.
    GatewayAccepted {
        /// Transaction id.
        tx_id: String,
        /// Whether the submission awaits listener confirmation.
        pending: bool,
    },

    /// Two writers disagreed on a terminal status; the stored status was kept.
    StatusConflict {
        /// Transaction id.
        tx_id: String,
        /// The disagreement.
        conflict: StatusConflict,
    },

    /// A gateway submission was not seen in any block within the window.
    Unconfirmed {
        /// Transaction id.
        tx_id: String,
    },

    /// A listener observation cleared the unconfirmed flag.
    UnconfirmedCleared {
        /// Transaction id.
        tx_id: String,
        /// Block the transaction was found in.
        block: Option<u64>,
    },
}

impl PipelineEvent {
    /// Short stable name, used as the `pipeline.event` field.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::Subscribed { .. } => "subscribed",
            Self::SubscribeFailed { .. } => "subscribe_failed",
            Self::CursorLoadFailed { .. } => "cursor_load_failed",
            Self::BackingOff { .. } => "backing_off",
            Self::BlockProcessed { .. } => "block_processed",
            Self::BlockRedelivered { .. } => "block_redelivered",
            Self::BlockGap { .. } => "block_gap",
            Self::DecodeFailed { .. } => "decode_failed",
            Self::BlockRejected { .. } => "block_rejected",
            Self::StreamEnded { .. } => "stream_ended",
            Self::StreamFailed { .. } => "stream_failed",
            Self::GatewayAccepted { .. } => "gateway_accepted",
            Self::StatusConflict { .. } => "status_conflict",
            Self::Unconfirmed { .. } => "unconfirmed",
            Self::UnconfirmedCleared { .. } => "unconfirmed_cleared",
        }
    }
}

/// Receiver of [`PipelineEvent`]s.
pub trait PipelineObserver: Send + Sync {
    /// Handles one event.
    fn observe(&self, event: &PipelineEvent);
}

impl<O: PipelineObserver + ?Sized> PipelineObserver for Arc<O> {
    fn observe(&self, event: &PipelineEvent) {
        (**self).observe(event);
    }
}

/// Observer that emits structured `tracing` events.
///
/// Failures and unconfirmed flags are logged at `WARN`, per-block progress at
/// `DEBUG`, everything else at `INFO`. Every event carries a `pipeline.event`
/// field with [`PipelineEvent::name`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn observe(&self, event: &PipelineEvent) {
        let name = event.name();
        match event {
            PipelineEvent::StateChanged { from, to } => {
                tracing::info!(pipeline.event = name, from = %from, to = %to, "listener state changed");
            },
            PipelineEvent::Subscribed { start_block } => {
                tracing::info!(pipeline.event = name, start_block, "subscribed to block stream");
            },
            PipelineEvent::SubscribeFailed { start_block, error } => {
                tracing::warn!(
                    pipeline.event = name,
                    start_block,
                    transient = error.is_transient(),
                    error = %error,
                    "subscription failed"
                );
            },
            PipelineEvent::CursorLoadFailed { error } => {
                tracing::warn!(pipeline.event = name, error = %error, "cursor load failed");
            },
            PipelineEvent::BackingOff { attempt, delay } => {
                tracing::info!(
                    pipeline.event = name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "backing off before resubscribing"
                );
            },
            PipelineEvent::BlockProcessed { block, receipt, skipped } => {
                tracing::debug!(
                    pipeline.event = name,
                    block,
                    transactions = receipt.transactions(),
                    inserted = receipt.inserted,
                    merged = receipt.merged,
                    unchanged = receipt.unchanged,
                    skipped,
                    "block processed"
                );
            },
            PipelineEvent::BlockRedelivered { block, expected } => {
                tracing::debug!(pipeline.event = name, block, expected, "ignoring redelivered block");
            },
            PipelineEvent::BlockGap { block, expected } => {
                tracing::warn!(pipeline.event = name, block, expected, "block stream skipped ahead");
            },
            PipelineEvent::DecodeFailed { block, error } => {
                tracing::warn!(pipeline.event = name, block, error = %error, "skipping undecodable block");
            },
            PipelineEvent::BlockRejected { block, error } => {
                tracing::warn!(pipeline.event = name, block, error = %error, "block not stored");
            },
            PipelineEvent::StreamEnded { next_block } => {
                tracing::info!(pipeline.event = name, next_block, "block stream ended");
            },
            PipelineEvent::StreamFailed { next_block, error } => {
                tracing::warn!(pipeline.event = name, next_block, error = %error, "block stream failed");
            },
            PipelineEvent::GatewayAccepted { tx_id, pending } => {
                tracing::debug!(pipeline.event = name, tx_id = %tx_id, pending, "gateway record stored");
            },
            PipelineEvent::StatusConflict { tx_id, conflict } => {
                tracing::warn!(
                    pipeline.event = name,
                    tx_id = %tx_id,
                    stored = %conflict.stored,
                    incoming = %conflict.incoming,
                    incoming_source = %conflict.incoming_source,
                    "conflicting terminal status ignored"
                );
            },
            PipelineEvent::Unconfirmed { tx_id } => {
                tracing::warn!(pipeline.event = name, tx_id = %tx_id, "gateway submission not seen in any block");
            },
            PipelineEvent::UnconfirmedCleared { tx_id, block } => {
                tracing::info!(pipeline.event = name, tx_id = %tx_id, block = ?block, "unconfirmed submission observed");
            },
        }
    }
}

/// Observer that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {
    fn observe(&self, _event: &PipelineEvent) {}
}

/// Forwards every event to each member, in insertion order.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn PipelineObserver>>,
}

impl ObserverSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer.
    #[must_use]
    pub fn with(mut self, observer: impl PipelineObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Returns `true` if the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet").field("observers", &self.observers.len()).finish()
    }
}

impl PipelineObserver for ObserverSet {
    fn observe(&self, event: &PipelineEvent) {
        for observer in &self.observers {
            observer.observe(event);
        }
    }
}
