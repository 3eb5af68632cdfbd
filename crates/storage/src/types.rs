//! Common types used across storage operations.

use bytes::Bytes;

/// Key-value pair returned from range queries.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use ledgersync_storage::KeyValue;
///
/// let kv = KeyValue::new(Bytes::from("tx/abc"), Bytes::from(r#"{"tx_id":"abc"}"#));
/// assert_eq!(kv.key, Bytes::from("tx/abc"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new key-value pair.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}
