//! Error types for the ingestion pipeline.
//!
//! - [`StreamError`]: the ledger stream client failed to subscribe or deliver.
//! - [`DecodeError`]: a block payload is structurally malformed.
//! - [`ReconcileError`]: the dedup store rejected a transaction write.
//! - [`ListenerError`]: the listener halted and needs operator attention.

use ledgersync_storage::{ConfigError, StorageError};
use thiserror::Error;

/// Errors reported by a [`LedgerStream`](crate::LedgerStream).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StreamError {
    /// The connection to the ledger dropped.
    #[error("stream disconnected: {message}")]
    Disconnected {
        /// Description of the disconnect.
        message: String,
    },

    /// The subscription call or a receive timed out.
    #[error("stream operation timed out")]
    Timeout,

    /// The ledger service is temporarily unavailable.
    #[error("ledger unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// The subscription request itself is invalid, such as an unknown channel.
    #[error("invalid subscription request: {message}")]
    InvalidRequest {
        /// Why the request was rejected.
        message: String,
    },

    /// The client identity is not allowed to subscribe.
    #[error("subscription unauthorized: {message}")]
    Unauthorized {
        /// Why the identity was rejected.
        message: String,
    },
}

impl StreamError {
    /// Creates a `Disconnected` error.
    #[must_use]
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Disconnected { message: message.into() }
    }

    /// Creates an `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Creates an `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Creates an `Unauthorized` error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    /// Returns `true` if resubscribing later may succeed.
    ///
    /// Invalid and unauthorized requests need operator intervention and halt
    /// the listener.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Timeout | Self::Unavailable { .. })
    }
}

/// A block payload that could not be decoded.
///
/// Decode errors are never retried: the same bytes always fail the same way.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// A protobuf message failed to parse.
    #[error("malformed {message}: {source}")]
    Protobuf {
        /// Which message failed.
        message: &'static str,
        /// The protobuf error.
        #[source]
        source: prost::DecodeError,
    },

    /// A required field is absent.
    #[error("missing {field}")]
    MissingField {
        /// The absent field.
        field: &'static str,
    },

    /// The block header disagrees with the event's block number.
    #[error("block header number {header} does not match event number {event}")]
    BlockNumberMismatch {
        /// Number in the block header.
        header: u64,
        /// Number on the delivered event.
        event: u64,
    },

    /// An endorser transaction has an empty transaction id.
    #[error("envelope {index} has an empty transaction id")]
    EmptyTransactionId {
        /// Position of the envelope in the block.
        index: usize,
    },

    /// An endorser transaction carries no chaincode invocation.
    #[error("transaction {tx_id} has no chaincode action")]
    MissingChaincodeAction {
        /// The transaction id.
        tx_id: String,
    },
}

impl DecodeError {
    pub(crate) fn protobuf(message: &'static str) -> impl FnOnce(prost::DecodeError) -> Self {
        move |source| Self::Protobuf { message, source }
    }
}

/// A transaction write the dedup store did not accept.
#[derive(Debug, Error)]
#[error("failed to reconcile transaction {tx_id}")]
pub struct ReconcileError {
    /// The transaction whose write failed.
    pub tx_id: String,
    /// The store failure.
    #[source]
    pub source: StorageError,
}

impl ReconcileError {
    /// Returns `true` if the underlying store failure was transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.source.is_transient()
    }
}

/// Reasons the listener halted.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ListenerError {
    /// The ledger rejected the subscription in a way retrying cannot fix.
    #[error("fatal stream error")]
    Fatal(#[source] StreamError),

    /// The cursor store failed in a way retrying cannot fix.
    #[error("cursor store failure")]
    Storage(#[source] StorageError),

    /// The listener configuration is invalid.
    #[error("invalid listener configuration")]
    Config(#[from] ConfigError),

    /// The listener task panicked or was aborted.
    #[error("listener task failed: {message}")]
    Task {
        /// The join error description.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(StreamError::disconnected("reset by peer"), true)]
    #[case(StreamError::Timeout, true)]
    #[case(StreamError::unavailable("ordering service down"), true)]
    #[case(StreamError::invalid_request("unknown channel"), false)]
    #[case(StreamError::unauthorized("certificate expired"), false)]
    fn test_stream_error_classification(#[case] err: StreamError, #[case] transient: bool) {
        assert_eq!(err.is_transient(), transient, "{err}");
    }

    #[test]
    fn test_reconcile_error_keeps_source() {
        let err = ReconcileError { tx_id: "tx1".into(), source: StorageError::timeout() };
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "failed to reconcile transaction tx1");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("Operation timeout"));
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::BlockNumberMismatch { header: 4, event: 5 };
        assert_eq!(err.to_string(), "block header number 4 does not match event number 5");
    }
}
