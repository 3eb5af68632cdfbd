//! Store metrics collection.
//!
//! [`StoreMetrics`] counts dedup-store outcomes, compare-and-set conflicts,
//! retries and errors. It is cheaply cloneable; all clones share the same
//! counters.
//!
//! # Memory Ordering
//!
//! All counters use `Ordering::Relaxed`. Each counter is independent and
//! monotonically increasing, so a snapshot may observe counters slightly out
//! of step with each other. That is acceptable for telemetry.
//!
//! # Usage
//!
//! ```
//! use std::time::Duration;
//! use ledgersync_storage::StoreMetrics;
//!
//! let metrics = StoreMetrics::new();
//! metrics.record_upsert(Duration::from_micros(120));
//! metrics.record_inserted();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.upsert_count, 1);
//! assert_eq!(snapshot.inserted_count, 1);
//! assert_eq!(snapshot.avg_upsert_latency_us(), 120.0);
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

#[derive(Debug, Default)]
struct Counters {
    upsert_count: AtomicU64,
    upsert_latency_us: AtomicU64,
    inserted_count: AtomicU64,
    merged_count: AtomicU64,
    unchanged_count: AtomicU64,
    status_conflict_count: AtomicU64,
    flagged_count: AtomicU64,
    conflict_count: AtomicU64,
    retry_count: AtomicU64,
    retry_exhausted_count: AtomicU64,
    error_count: AtomicU64,
    cursor_save_count: AtomicU64,
}

/// Point-in-time copy of [`StoreMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    /// Completed upserts, whatever their outcome.
    pub upsert_count: u64,
    /// Cumulative upsert latency in microseconds.
    pub upsert_latency_us: u64,
    /// Upserts that created a new record.
    pub inserted_count: u64,
    /// Upserts that changed an existing record.
    pub merged_count: u64,
    /// Upserts that left the stored record untouched.
    pub unchanged_count: u64,
    /// Merges that saw contradictory terminal statuses.
    pub status_conflict_count: u64,
    /// Records newly flagged as unconfirmed.
    pub flagged_count: u64,
    /// Compare-and-set conflicts observed.
    pub conflict_count: u64,
    /// Transient-error retries performed.
    pub retry_count: u64,
    /// Operations that failed after exhausting retries.
    pub retry_exhausted_count: u64,
    /// Operations that returned an error to the caller.
    pub error_count: u64,
    /// Cursor positions persisted.
    pub cursor_save_count: u64,
}

impl StoreMetricsSnapshot {
    /// Returns the mean upsert latency in microseconds, or `0.0` if no
    /// upserts completed.
    #[must_use]
    pub fn avg_upsert_latency_us(&self) -> f64 {
        if self.upsert_count == 0 {
            0.0
        } else {
            self.upsert_latency_us as f64 / self.upsert_count as f64
        }
    }
}

/// Shared counters for store operations.
#[derive(Debug, Clone, Default)]
pub struct StoreMetrics {
    inner: Arc<Counters>,
}

impl StoreMetrics {
    /// Creates a new set of zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed upsert and its latency.
    pub fn record_upsert(&self, elapsed: Duration) {
        self.inner.upsert_count.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.inner.upsert_latency_us.fetch_add(micros, Ordering::Relaxed);
    }

    /// Records an upsert that created a record.
    pub fn record_inserted(&self) {
        self.inner.inserted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an upsert that changed an existing record.
    pub fn record_merged(&self) {
        self.inner.merged_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an upsert that wrote nothing.
    pub fn record_unchanged(&self) {
        self.inner.unchanged_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a merge with contradictory terminal statuses.
    pub fn record_status_conflict(&self) {
        self.inner.status_conflict_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a record newly flagged as unconfirmed.
    pub fn record_flagged(&self) {
        self.inner.flagged_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a compare-and-set conflict.
    pub fn record_conflict(&self) {
        self.inner.conflict_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a transient-error retry.
    pub fn record_retry(&self) {
        self.inner.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an operation that exhausted its retries.
    pub fn record_retry_exhausted(&self) {
        self.inner.retry_exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an operation error surfaced to the caller.
    pub fn record_error(&self) {
        self.inner.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a persisted cursor position.
    pub fn record_cursor_save(&self) {
        self.inner.cursor_save_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        let c = &self.inner;
        StoreMetricsSnapshot {
            upsert_count: c.upsert_count.load(Ordering::Relaxed),
            upsert_latency_us: c.upsert_latency_us.load(Ordering::Relaxed),
            inserted_count: c.inserted_count.load(Ordering::Relaxed),
            merged_count: c.merged_count.load(Ordering::Relaxed),
            unchanged_count: c.unchanged_count.load(Ordering::Relaxed),
            status_conflict_count: c.status_conflict_count.load(Ordering::Relaxed),
            flagged_count: c.flagged_count.load(Ordering::Relaxed),
            conflict_count: c.conflict_count.load(Ordering::Relaxed),
            retry_count: c.retry_count.load(Ordering::Relaxed),
            retry_exhausted_count: c.retry_exhausted_count.load(Ordering::Relaxed),
            error_count: c.error_count.load(Ordering::Relaxed),
            cursor_save_count: c.cursor_save_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = StoreMetrics::new();
        let clone = metrics.clone();

        clone.record_conflict();
        clone.record_conflict();
        metrics.record_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.conflict_count, 2);
        assert_eq!(snapshot.retry_count, 1);
    }

    #[test]
    fn test_avg_latency_empty_is_zero() {
        assert_eq!(StoreMetrics::new().snapshot().avg_upsert_latency_us(), 0.0);
    }
}
