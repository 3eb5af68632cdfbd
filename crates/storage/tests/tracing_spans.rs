//! Integration test verifying that `#[instrument]` annotations produce
//! the expected spans on store operations.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use chrono::Utc;
use ledgersync_storage::{
    BackendCursorStore, BackendDedupStore, CursorStore, DedupStore, MemoryBackend, RecordSource,
    StorageBackend, TransactionRecord,
};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names as they are created
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

fn collect() -> (Arc<Mutex<Vec<String>>>, tracing::subscriber::DefaultGuard) {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));
    (spans, guard)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memory_backend_compare_and_set_creates_span() {
    let (spans, _guard) = collect();

    let backend = MemoryBackend::new();
    backend.compare_and_set(b"key", None, b"value".to_vec()).await.expect("cas should succeed");

    let recorded = spans.lock().expect("lock poisoned");
    assert!(
        recorded.iter().any(|s| s == "compare_and_set"),
        "expected a 'compare_and_set' span, got: {recorded:?}"
    );
}

#[tokio::test]
async fn dedup_upsert_nests_retry_and_backend_spans() {
    let (spans, _guard) = collect();

    let store = BackendDedupStore::builder().backend(MemoryBackend::new()).build();
    let record = TransactionRecord::builder()
        .tx_id("tx1")
        .ingested_at(Utc::now())
        .source(RecordSource::Listener)
        .build();
    store.upsert(record).await.expect("upsert should succeed");

    let recorded = spans.lock().expect("lock poisoned");
    for expected in ["upsert", "with_retry", "with_cas_retry", "get", "compare_and_set"] {
        assert!(
            recorded.iter().any(|s| s == expected),
            "expected a '{expected}' span, got: {recorded:?}"
        );
    }
}

#[tokio::test]
async fn cursor_save_creates_span() {
    let (spans, _guard) = collect();

    let store = BackendCursorStore::builder().backend(MemoryBackend::new()).build();
    store.save(3).await.expect("save should succeed");

    let recorded = spans.lock().expect("lock poisoned");
    assert!(recorded.iter().any(|s| s == "save"), "expected a 'save' span, got: {recorded:?}");
}
