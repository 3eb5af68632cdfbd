//! Pipeline counters.
//!
//! [`Metrics`] is a [`PipelineObserver`] that counts events. Counters use
//! `Ordering::Relaxed`; a snapshot may see them slightly out of step.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::observer::{PipelineEvent, PipelineObserver};

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Subscriptions opened.
    pub subscriptions: u64,
    /// Subscription attempts that failed, including cursor load failures.
    pub subscribe_failures: u64,
    /// Visits to the backing-off state.
    pub backoffs: u64,
    /// Blocks accepted with the cursor advanced.
    pub blocks_processed: u64,
    /// Transactions in accepted blocks.
    pub transactions_ingested: u64,
    /// Blocks that failed to decode.
    pub decode_errors: u64,
    /// Blocks the store did not accept.
    pub blocks_rejected: u64,
    /// Redelivered blocks ignored.
    pub blocks_redelivered: u64,
    /// Subscriptions that broke or ended.
    pub stream_interruptions: u64,
    /// Gateway submissions stored.
    pub gateway_records: u64,
    /// Records flagged unconfirmed.
    pub unconfirmed_flagged: u64,
    /// Unconfirmed flags cleared by the listener.
    pub unconfirmed_cleared: u64,
    /// Conflicting terminal statuses seen.
    pub status_conflicts: u64,
}

/// Counting observer.
#[derive(Debug, Default)]
pub struct Metrics {
    subscriptions: AtomicU64,
    subscribe_failures: AtomicU64,
    backoffs: AtomicU64,
    blocks_processed: AtomicU64,
    transactions_ingested: AtomicU64,
    decode_errors: AtomicU64,
    blocks_rejected: AtomicU64,
    blocks_redelivered: AtomicU64,
    stream_interruptions: AtomicU64,
    gateway_records: AtomicU64,
    unconfirmed_flagged: AtomicU64,
    unconfirmed_cleared: AtomicU64,
    status_conflicts: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Metrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            subscriptions: load(&self.subscriptions),
            subscribe_failures: load(&self.subscribe_failures),
            backoffs: load(&self.backoffs),
            blocks_processed: load(&self.blocks_processed),
            transactions_ingested: load(&self.transactions_ingested),
            decode_errors: load(&self.decode_errors),
            blocks_rejected: load(&self.blocks_rejected),
            blocks_redelivered: load(&self.blocks_redelivered),
            stream_interruptions: load(&self.stream_interruptions),
            gateway_records: load(&self.gateway_records),
            unconfirmed_flagged: load(&self.unconfirmed_flagged),
            unconfirmed_cleared: load(&self.unconfirmed_cleared),
            status_conflicts: load(&self.status_conflicts),
        }
    }
}

impl PipelineObserver for Metrics {
    fn observe(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Subscribed { .. } => bump(&self.subscriptions, 1),
            PipelineEvent::SubscribeFailed { .. } | PipelineEvent::CursorLoadFailed { .. } => {
                bump(&self.subscribe_failures, 1);
            },
            PipelineEvent::BackingOff { .. } => bump(&self.backoffs, 1),
            PipelineEvent::BlockProcessed { receipt, .. } => {
                bump(&self.blocks_processed, 1);
                bump(&self.transactions_ingested, receipt.transactions() as u64);
            },
            PipelineEvent::DecodeFailed { .. } => bump(&self.decode_errors, 1),
            PipelineEvent::BlockRejected { .. } => bump(&self.blocks_rejected, 1),
            PipelineEvent::BlockRedelivered { .. } => bump(&self.blocks_redelivered, 1),
            PipelineEvent::StreamEnded { .. }
            | PipelineEvent::StreamFailed { .. }
            | PipelineEvent::BlockGap { .. } => bump(&self.stream_interruptions, 1),
            PipelineEvent::GatewayAccepted { .. } => bump(&self.gateway_records, 1),
            PipelineEvent::Unconfirmed { .. } => bump(&self.unconfirmed_flagged, 1),
            PipelineEvent::UnconfirmedCleared { .. } => bump(&self.unconfirmed_cleared, 1),
            PipelineEvent::StatusConflict { .. } => bump(&self.status_conflicts, 1),
            PipelineEvent::StateChanged { .. } => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{coordinator::BlockReceipt, error::StreamError};

    #[test]
    fn test_counts_pipeline_events() {
        let metrics = Metrics::new();
        let receipt = BlockReceipt { inserted: 2, merged: 1, ..BlockReceipt::default() };

        metrics.observe(&PipelineEvent::Subscribed { start_block: 0 });
        metrics.observe(&PipelineEvent::BlockProcessed { block: 0, receipt, skipped: 0 });
        metrics.observe(&PipelineEvent::StreamFailed {
            next_block: 1,
            error: StreamError::disconnected("reset"),
        });
        metrics.observe(&PipelineEvent::BackingOff { attempt: 1, delay: Duration::from_secs(5) });
        metrics.observe(&PipelineEvent::Unconfirmed { tx_id: "tx4".into() });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.subscriptions, 1);
        assert_eq!(snapshot.blocks_processed, 1);
        assert_eq!(snapshot.transactions_ingested, 3);
        assert_eq!(snapshot.stream_interruptions, 1);
        assert_eq!(snapshot.backoffs, 1);
        assert_eq!(snapshot.unconfirmed_flagged, 1);
        assert_eq!(snapshot.decode_errors, 0);
    }
}
