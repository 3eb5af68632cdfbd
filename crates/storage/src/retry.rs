//! Retry helpers for store operations.
//!
//! [`with_retry`] retries an async operation on transient errors (connection
//! failures, timeouts). Non-transient errors are returned immediately.
//!
//! [`with_cas_retry`] retries a read-modify-write cycle on compare-and-set
//! conflict and gives up with [`StorageError::CasRetriesExhausted`].
//!
//! # Backoff Strategy
//!
//! Transient retries use exponential backoff with jitter:
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0-50% of the computed delay is added

use std::{future::Future, time::Duration};

use fail::fail_point;
use rand::Rng;

use crate::{
    config::{CasRetryConfig, RetryConfig},
    error::{StorageError, StorageResult},
    metrics::StoreMetrics,
};

/// Executes `operation` with automatic retry on transient errors.
///
/// Returns the result of the first successful call, or the last error if all
/// retry attempts are exhausted. Only errors where
/// [`StorageError::is_transient`] returns `true` are retried.
///
/// When `metrics` is provided, each retry increments `retry_count` and an
/// exhausted transient failure increments `retry_exhausted_count`.
#[tracing::instrument(skip(config, metrics, operation), fields(max_retries = config.max_retries))]
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    metrics: Option<&StoreMetrics>,
    operation_name: &str,
    mut operation: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                if let Some(m) = metrics {
                    m.record_retry();
                }
                let delay = compute_backoff(config, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff",
                );
                fail_point!("retry-before-sleep");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => {
                if attempt > 0
                    && err.is_transient()
                    && let Some(m) = metrics
                {
                    m.record_retry_exhausted();
                }
                return Err(err);
            },
        }
    }
}

/// Retries a read-modify-write cycle on compare-and-set conflict.
///
/// The `operation` closure performs the full cycle: read the current value,
/// compute the mutation, and write back with a compare-and-set condition. On
/// [`StorageError::Conflict`] the closure is re-invoked up to
/// `config.max_retries` times, sleeping `base_delay` plus jitter in between.
///
/// Non-conflict errors are returned immediately without retry.
///
/// # Errors
///
/// Returns [`StorageError::CasRetriesExhausted`] when every attempt
/// conflicts.
#[tracing::instrument(skip(config, metrics, operation), fields(max_retries = config.max_retries))]
pub async fn with_cas_retry<F, Fut, T>(
    config: &CasRetryConfig,
    metrics: Option<&StoreMetrics>,
    mut operation: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let attempts = config.max_retries.saturating_add(1);
    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(StorageError::Conflict) => {
                if let Some(m) = metrics {
                    m.record_conflict();
                }
                if attempt + 1 == attempts {
                    break;
                }
                let delay = cas_delay(config);
                tracing::debug!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "compare-and-set conflict, retrying after jitter",
                );
                fail_point!("cas-retry-before-sleep");
                tokio::time::sleep(delay).await;
            },
            Err(err) => return Err(err),
        }
    }

    tracing::warn!(attempts, "compare-and-set retries exhausted");
    Err(StorageError::cas_retries_exhausted(attempts))
}

fn cas_delay(config: &CasRetryConfig) -> Duration {
    let range = config.base_delay.as_millis() as u64;
    if range == 0 {
        return config.base_delay;
    }
    config.base_delay + Duration::from_millis(rand::rng().random_range(0..=range))
}

/// Computes the backoff duration for the given zero-based retry number.
///
/// `min(initial_backoff * 2^attempt, max_backoff) + random(0..=50% of delay)`
pub(crate) fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let capped = config.initial_backoff.saturating_mul(factor).min(config.max_backoff);

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        capped + Duration::from_millis(rand::rng().random_range(0..=jitter_range))
    } else {
        capped
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::rstest;

    use super::*;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(max_retries)
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[rstest]
    #[case(0, 100, 150)]
    #[case(1, 200, 300)]
    #[case(2, 400, 600)]
    #[case(6, 5_000, 7_500)]
    fn test_compute_backoff_bounds(#[case] attempt: u32, #[case] min_ms: u64, #[case] max_ms: u64) {
        let config = RetryConfig::builder()
            .max_retries(10)
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(5))
            .build()
            .unwrap();

        let delay = compute_backoff(&config, attempt);
        assert!(delay >= Duration::from_millis(min_ms), "attempt {attempt}: {delay:?}");
        assert!(delay <= Duration::from_millis(max_ms), "attempt {attempt}: {delay:?}");
    }

    #[test]
    fn test_compute_backoff_survives_huge_attempt() {
        let config = RetryConfig::default();
        let delay = compute_backoff(&config, 200);
        assert!(delay <= config.max_backoff + config.max_backoff / 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failure() {
        let call_count = AtomicU32::new(0);

        let result = with_retry(&fast_retry(3), None, "test_op", || {
            let attempt = call_count.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt < 2 { Err(StorageError::connection("temporary")) } else { Ok(42) }
            }
        })
        .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(call_count.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_non_transient_error_not_retried() {
        let call_count = AtomicU32::new(0);

        let result: StorageResult<i32> = with_retry(&fast_retry(3), None, "test_op", || {
            call_count.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::serialization("bad json")) }
        })
        .await;

        assert!(matches!(result, Err(StorageError::Serialization { .. })));
        assert_eq!(call_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error_and_records_metrics() {
        let metrics = StoreMetrics::new();
        let call_count = AtomicU32::new(0);

        let result: StorageResult<i32> =
            with_retry(&fast_retry(2), Some(&metrics), "test_op", || {
                let attempt = call_count.fetch_add(1, Ordering::Relaxed);
                async move {
                    if attempt == 0 {
                        Err(StorageError::timeout())
                    } else {
                        Err(StorageError::connection("network down"))
                    }
                }
            })
            .await;

        assert!(matches!(result, Err(StorageError::Connection { .. })));
        assert_eq!(call_count.load(Ordering::Relaxed), 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retry_count, 2);
        assert_eq!(snapshot.retry_exhausted_count, 1);
    }

    #[tokio::test]
    async fn test_retry_disabled_with_zero_max_retries() {
        let call_count = AtomicU32::new(0);

        let result: StorageResult<i32> = with_retry(&fast_retry(0), None, "test_op", || {
            call_count.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::connection("fail")) }
        })
        .await;

        assert!(matches!(result, Err(StorageError::Connection { .. })));
        assert_eq!(call_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cas_retry_returns_value_after_conflicts() {
        let config =
            CasRetryConfig::builder().max_retries(3).base_delay(Duration::from_millis(1)).build();
        let metrics = StoreMetrics::new();
        let call_count = AtomicU32::new(0);

        let result = with_cas_retry(&config, Some(&metrics), || {
            let attempt = call_count.fetch_add(1, Ordering::Relaxed);
            async move { if attempt < 2 { Err(StorageError::conflict()) } else { Ok("merged") } }
        })
        .await;

        assert_eq!(result.ok(), Some("merged"));
        assert_eq!(call_count.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.snapshot().conflict_count, 2);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(2, 3)]
    #[tokio::test]
    async fn test_cas_retry_exhausted(#[case] max_retries: u32, #[case] expected_attempts: u32) {
        let config = CasRetryConfig::builder()
            .max_retries(max_retries)
            .base_delay(Duration::from_millis(1))
            .build();
        let call_count = AtomicU32::new(0);

        let result: StorageResult<()> = with_cas_retry(&config, None, || {
            call_count.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::conflict()) }
        })
        .await;

        assert!(
            matches!(result, Err(StorageError::CasRetriesExhausted { attempts }) if attempts == expected_attempts),
            "got: {result:?}",
        );
        assert_eq!(call_count.load(Ordering::Relaxed), expected_attempts);
    }

    #[tokio::test]
    async fn test_cas_retry_transient_error_not_retried() {
        let config = CasRetryConfig::default();
        let call_count = AtomicU32::new(0);

        let result: StorageResult<()> = with_cas_retry(&config, None, || {
            call_count.fetch_add(1, Ordering::Relaxed);
            async { Err(StorageError::timeout()) }
        })
        .await;

        assert!(matches!(result, Err(StorageError::Timeout)));
        assert_eq!(call_count.load(Ordering::Relaxed), 1);
    }
}
