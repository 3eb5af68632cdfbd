//! Durable listener cursor.
//!
//! The cursor is the number of the last block the listener fully processed.
//! A listener resumes at `cursor + 1`; a store that has never been saved
//! loads as `None`.
//!
//! Two implementations are provided:
//! - [`BackendCursorStore`] keeps the cursor under `cursor/{name}` in any
//!   [`StorageBackend`], next to the records it guards.
//! - [`FileCursorStore`] keeps it in a small text file. Each save writes and
//!   syncs a sibling temp file, then persists it over the target, so a crash
//!   leaves either the old or the new cursor on disk.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use fail::fail_point;

use crate::{
    backend::StorageBackend,
    config::RetryConfig,
    error::{StorageError, StorageResult},
    metrics::StoreMetrics,
    retry::with_retry,
};

/// Key prefix for cursors stored in a backend.
pub const CURSOR_KEY_PREFIX: &str = "cursor/";

/// Durable store of the last processed block number.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Returns the saved cursor, or `None` if nothing was saved yet.
    async fn load(&self) -> StorageResult<Option<u64>>;

    /// Persists `block_number` as the cursor.
    async fn save(&self, block_number: u64) -> StorageResult<()>;
}

#[async_trait]
impl<S: CursorStore + ?Sized> CursorStore for Arc<S> {
    async fn load(&self) -> StorageResult<Option<u64>> {
        (**self).load().await
    }

    async fn save(&self, block_number: u64) -> StorageResult<()> {
        (**self).save(block_number).await
    }
}

fn parse_cursor(raw: &[u8]) -> StorageResult<u64> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| StorageError::serialization_with_source("cursor is not UTF-8", e))?;
    text.trim()
        .parse::<u64>()
        .map_err(|e| StorageError::serialization_with_source("cursor is not a block number", e))
}

/// [`CursorStore`] kept in a [`StorageBackend`].
#[derive(Debug, Clone)]
pub struct BackendCursorStore<B> {
    backend: B,
    key: Vec<u8>,
    retry: RetryConfig,
    metrics: StoreMetrics,
}

#[bon::bon]
impl<B: StorageBackend> BackendCursorStore<B> {
    /// Creates a cursor store named `name` over `backend`.
    ///
    /// Independent listeners sharing a backend use distinct names.
    #[builder]
    pub fn new(
        backend: B,
        #[builder(into, default = "main".to_string())] name: String,
        #[builder(default)] retry: RetryConfig,
        #[builder(default)] metrics: StoreMetrics,
    ) -> Self {
        let key = format!("{CURSOR_KEY_PREFIX}{name}").into_bytes();
        Self { backend, key, retry, metrics }
    }
}

#[async_trait]
impl<B: StorageBackend> CursorStore for BackendCursorStore<B> {
    #[tracing::instrument(skip(self))]
    async fn load(&self) -> StorageResult<Option<u64>> {
        let raw = with_retry(&self.retry, Some(&self.metrics), "cursor_load", || {
            self.backend.get(&self.key)
        })
        .await?;
        raw.map(|bytes| parse_cursor(&bytes)).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn save(&self, block_number: u64) -> StorageResult<()> {
        fail_point!("cursor-save", |_| Err(StorageError::connection("injected cursor failure")));

        with_retry(&self.retry, Some(&self.metrics), "cursor_save", || {
            self.backend.set(self.key.clone(), block_number.to_string().into_bytes())
        })
        .await?;
        self.metrics.record_cursor_save();
        Ok(())
    }
}

/// [`CursorStore`] kept in a file.
///
/// # Example
///
/// ```
/// use ledgersync_storage::{CursorStore, FileCursorStore};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let dir = std::env::temp_dir().join(format!("cursor-doc-{}", std::process::id()));
/// let store = FileCursorStore::new(dir.join("listener.cursor"));
///
/// assert_eq!(store.load().await.unwrap(), None);
/// store.save(41).await.unwrap();
/// assert_eq!(store.load().await.unwrap(), Some(41));
/// # let _ = std::fs::remove_dir_all(dir);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    /// Creates a store backed by the file at `path`.
    ///
    /// Missing parent directories are created on the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the cursor file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(context: &str, err: std::io::Error) -> StorageError {
    StorageError::internal_with_source(context.to_string(), err)
}

/// Replaces the cursor file at `path` with `block_number`.
///
/// The data and, on Unix, the directory entry are synced before returning.
fn write_cursor_file(path: &Path, block_number: u64) -> StorageResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| io_error("failed to create cursor directory", e))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| io_error("failed to create cursor temp file", e))?;
    temp.write_all(block_number.to_string().as_bytes())
        .map_err(|e| io_error("failed to write cursor file", e))?;
    temp.as_file().sync_all().map_err(|e| io_error("failed to sync cursor file", e))?;
    temp.persist(path).map_err(|e| io_error("failed to replace cursor file", e.error))?;

    #[cfg(unix)]
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_error("failed to sync cursor directory", e))?;

    Ok(())
}

#[async_trait]
impl CursorStore for FileCursorStore {
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> StorageResult<Option<u64>> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => parse_cursor(&raw).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error("failed to read cursor file", err)),
        }
    }

    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    async fn save(&self, block_number: u64) -> StorageResult<()> {
        fail_point!("cursor-save", |_| Err(StorageError::connection("injected cursor failure")));

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_cursor_file(&path, block_number))
            .await
            .map_err(|e| StorageError::internal_with_source("cursor write task failed", e))?
    }
}
