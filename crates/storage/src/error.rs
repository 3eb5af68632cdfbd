//! Storage error types and result alias.
//!
//! This module defines the error types that can occur during storage operations.
//! All storage backends and the stores built on them map their internal errors
//! to these standardized error types.
//!
//! # Error Types
//!
//! - [`StorageError::Conflict`] - Compare-and-set precondition failed
//! - [`StorageError::Connection`] - Network or connection-related failures
//! - [`StorageError::Serialization`] - Data encoding/decoding failures
//! - [`StorageError::Internal`] - Backend-specific internal errors
//! - [`StorageError::Timeout`] - Operation exceeded time limit
//! - [`StorageError::CasRetriesExhausted`] - Every compare-and-set attempt conflicted
//!
//! # Example
//!
//! ```
//! use ledgersync_storage::{StorageError, StorageResult};
//!
//! fn parse_block(raw: &str) -> StorageResult<u64> {
//!     raw.parse().map_err(|e| StorageError::serialization_with_source("bad block number", e))
//! }
//!
//! assert!(parse_block("41").is_ok());
//! assert!(!parse_block("x").unwrap_err().is_transient());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via the `#[source]` attribute, enabling
/// debugging tools to display the full error context.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A compare-and-set precondition did not hold.
    ///
    /// Another writer modified the key between the read and the write. The
    /// read-modify-write cycle should be retried.
    #[error("Write conflict")]
    Conflict,

    /// Connection or network error.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization or deserialization error.
    ///
    /// Typically indicates data corruption or schema incompatibility.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal storage backend error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out.
    #[error("Operation timeout")]
    Timeout,

    /// A read-modify-write cycle hit a conflict on every attempt.
    #[error("Compare-and-set retries exhausted after {attempts} attempts")]
    CasRetriesExhausted {
        /// Total number of attempts made, including the first.
        attempts: u32,
    },
}

impl StorageError {
    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `CasRetriesExhausted` error.
    #[must_use]
    pub fn cas_retries_exhausted(attempts: u32) -> Self {
        Self::CasRetriesExhausted { attempts }
    }

    /// Returns `true` if the error is likely to succeed on retry.
    ///
    /// Connection failures and timeouts are transient. Conflicts are not:
    /// they need a fresh read before the write is attempted again, which
    /// [`with_cas_retry`](crate::retry::with_cas_retry) handles.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}

/// Configuration validation errors.
///
/// Returned by the validating builders of every configuration type in the
/// workspace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required field was not provided or was empty.
    #[error("{field} is required")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A numeric field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// The minimum accepted value.
        min: String,
        /// The value that was provided.
        value: String,
    },

    /// A duration or numeric field must be strictly positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Name of the offending field.
        field: &'static str,
        /// The value that was provided.
        value: String,
    },

    /// Two related fields are inconsistent with each other.
    #[error("{field} is invalid: {reason}")]
    InvalidRange {
        /// Name of the offending field.
        field: &'static str,
        /// Why the combination is rejected.
        reason: String,
    },
}
