//! The ledger block stream seam.
//!
//! [`LedgerStream`] abstracts the ledger's deliver service. The listener only
//! ever calls [`subscribe`](LedgerStream::subscribe) and reads the returned
//! stream in order; reconnection and resumption are its own responsibility.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::StreamError;

/// One committed block as delivered by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    /// Ledger-assigned block number.
    pub number: u64,
    /// Encoded block.
    pub payload: Bytes,
}

impl BlockEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(number: u64, payload: impl Into<Bytes>) -> Self {
        Self { number, payload: payload.into() }
    }
}

/// Ordered stream of delivered blocks.
///
/// The stream ends when the ledger closes the subscription. An `Err` item
/// means the subscription broke; the listener drops the stream afterwards.
pub type BlockStream = BoxStream<'static, Result<BlockEvent, StreamError>>;

/// A client for the ledger's block deliver service.
#[async_trait]
pub trait LedgerStream: Send + Sync {
    /// Opens a subscription delivering blocks from `start_block` onward in
    /// commit order.
    ///
    /// # Errors
    ///
    /// Returns a [`StreamError`]; see [`StreamError::is_transient`] for which
    /// failures the listener retries.
    async fn subscribe(&self, start_block: u64) -> Result<BlockStream, StreamError>;
}

#[async_trait]
impl<L: LedgerStream + ?Sized> LedgerStream for Arc<L> {
    async fn subscribe(&self, start_block: u64) -> Result<BlockStream, StreamError> {
        (**self).subscribe(start_block).await
    }
}
