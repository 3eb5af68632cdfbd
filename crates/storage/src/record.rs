//! Transaction records and their merge rules.
//!
//! A [`TransactionRecord`] is the single stored fact about one ledger
//! transaction id. Both the block listener and the gateway submission path
//! produce records; [`TransactionRecord::merge`] folds a newly observed record
//! into the stored one so that each id converges to one record no matter
//! which path wrote first.
//!
//! # Merge Rules
//!
//! - Status is monotonic: `Unknown` may become `Valid` or `Invalid` once.
//!   A contradictory terminal status is kept as stored and reported as a
//!   [`StatusConflict`].
//! - Block number and ledger time are filled in when absent. Listener values
//!   replace gateway values.
//! - Empty channel, chaincode, function and argument fields are filled in.
//! - The earliest ingestion time is kept.
//! - `observed_by` is the union of all contributing sources.
//! - A listener observation clears the `unconfirmed` flag.
//! - `source` names the writer of the most recent merge that changed
//!   something. A merge that changes nothing leaves the record untouched.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ledger validation outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    /// Not yet known, either because the ledger has not validated the
    /// transaction or because no source has reported a verdict.
    #[default]
    Unknown,
    /// Committed with a valid verdict.
    Valid,
    /// Committed with an invalid verdict.
    Invalid,
}

impl ValidationStatus {
    /// Returns `true` for `Valid` and `Invalid`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unknown => "UNKNOWN",
            Self::Valid => "VALID",
            Self::Invalid => "INVALID",
        })
    }
}

/// Which write path produced a record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordSource {
    /// Observed in a committed block by the listener.
    Listener,
    /// Reported by the synchronous gateway submission path.
    Gateway,
}

impl std::fmt::Display for RecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Listener => "LISTENER",
            Self::Gateway => "GATEWAY",
        })
    }
}

/// One entry in a record's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Status after the change.
    pub status: ValidationStatus,
    /// Source whose observation caused the change.
    pub source: RecordSource,
    /// When that observation was ingested.
    pub at: DateTime<Utc>,
}

/// Two sources disagreeing on a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusConflict {
    /// Status kept in the store.
    pub stored: ValidationStatus,
    /// Status the incoming record carried.
    pub incoming: ValidationStatus,
    /// Source of the incoming record.
    pub incoming_source: RecordSource,
}

/// The stored fact about one transaction id.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use ledgersync_storage::{RecordSource, TransactionRecord, ValidationStatus};
///
/// let record = TransactionRecord::builder()
///     .tx_id("tx3")
///     .channel("mychannel")
///     .source(RecordSource::Gateway)
///     .status(ValidationStatus::Valid)
///     .function("CreateAsset")
///     .args(vec!["asset1".into(), "blue".into()])
///     .ingested_at(Utc::now())
///     .build();
///
/// assert_eq!(record.block_number, None);
/// assert_eq!(record.commit_timestamp(), record.ingested_at);
/// assert!(record.observed_by.contains(&RecordSource::Gateway));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Ledger transaction id, the uniqueness key.
    pub tx_id: String,
    /// Channel the transaction was submitted on.
    pub channel: String,
    /// Chaincode the transaction invoked.
    pub chaincode: String,
    /// Block containing the transaction, once known.
    pub block_number: Option<u64>,
    /// Position of the transaction's envelope within its block, once known.
    #[serde(default)]
    pub tx_index: Option<u32>,
    /// Validation status.
    pub status: ValidationStatus,
    /// Raw ledger validation code, when reported by the listener.
    pub validation_code: Option<i32>,
    /// Invoked chaincode function.
    pub function: String,
    /// Function arguments, in order.
    pub args: Vec<String>,
    /// Timestamp recorded in the transaction header, when decodable.
    pub ledger_time: Option<DateTime<Utc>>,
    /// When this process first saw the id.
    pub ingested_at: DateTime<Utc>,
    /// Writer of the most recent merge.
    pub source: RecordSource,
    /// Every source that has contributed to this record.
    pub observed_by: BTreeSet<RecordSource>,
    /// Raised when a gateway submission was not seen in any block in time.
    pub unconfirmed: bool,
    /// Append-only log of status values.
    pub history: Vec<StatusChange>,
}

#[bon::bon]
impl TransactionRecord {
    /// Creates a record as first observed by one source.
    ///
    /// `observed_by` is seeded with `source` and `history` with the initial
    /// status.
    #[builder]
    pub fn new(
        #[builder(into)] tx_id: String,
        #[builder(into, default)] channel: String,
        #[builder(into, default)] chaincode: String,
        block_number: Option<u64>,
        tx_index: Option<u32>,
        #[builder(default)] status: ValidationStatus,
        validation_code: Option<i32>,
        #[builder(into, default)] function: String,
        #[builder(default)] args: Vec<String>,
        ledger_time: Option<DateTime<Utc>>,
        ingested_at: DateTime<Utc>,
        source: RecordSource,
    ) -> Self {
        Self {
            tx_id,
            channel,
            chaincode,
            block_number,
            tx_index,
            status,
            validation_code,
            function,
            args,
            ledger_time,
            ingested_at,
            source,
            observed_by: BTreeSet::from([source]),
            unconfirmed: false,
            history: vec![StatusChange { status, source, at: ingested_at }],
        }
    }
}

impl TransactionRecord {
    /// Best-effort commit time: ledger time when known, else ingestion time.
    #[must_use]
    pub fn commit_timestamp(&self) -> DateTime<Utc> {
        self.ledger_time.unwrap_or(self.ingested_at)
    }

    /// Returns `true` once the listener has seen this id in a block.
    #[must_use]
    pub fn is_observed_by_listener(&self) -> bool {
        self.observed_by.contains(&RecordSource::Listener)
    }

    /// Folds `incoming` into this record.
    ///
    /// Pure: the receiver is not modified. The returned [`Merge`] carries the
    /// resulting record and what changed.
    #[must_use]
    pub fn merge(&self, incoming: &TransactionRecord) -> Merge {
        let mut merged = self.clone();
        let mut status_conflict = None;
        let from_listener = incoming.source == RecordSource::Listener;

        match (self.status.is_terminal(), incoming.status.is_terminal()) {
            (false, true) => {
                merged.status = incoming.status;
                merged.history.push(StatusChange {
                    status: incoming.status,
                    source: incoming.source,
                    at: incoming.ingested_at,
                });
            },
            (true, true) if self.status != incoming.status => {
                status_conflict = Some(StatusConflict {
                    stored: self.status,
                    incoming: incoming.status,
                    incoming_source: incoming.source,
                });
            },
            _ => {},
        }

        if incoming.validation_code.is_some() && (from_listener || merged.validation_code.is_none())
        {
            merged.validation_code = incoming.validation_code;
        }
        if incoming.block_number.is_some() && (from_listener || merged.block_number.is_none()) {
            merged.block_number = incoming.block_number;
        }
        if incoming.tx_index.is_some() && (from_listener || merged.tx_index.is_none()) {
            merged.tx_index = incoming.tx_index;
        }
        if incoming.ledger_time.is_some() && (from_listener || merged.ledger_time.is_none()) {
            merged.ledger_time = incoming.ledger_time;
        }

        fill_if_empty(&mut merged.channel, &incoming.channel);
        fill_if_empty(&mut merged.chaincode, &incoming.chaincode);
        fill_if_empty(&mut merged.function, &incoming.function);
        if merged.args.is_empty() && !incoming.args.is_empty() {
            merged.args.clone_from(&incoming.args);
        }

        merged.ingested_at = merged.ingested_at.min(incoming.ingested_at);
        merged.observed_by.extend(incoming.observed_by.iter().copied());

        let cleared_unconfirmed = self.unconfirmed && from_listener;
        if cleared_unconfirmed {
            merged.unconfirmed = false;
        }

        let changed = merged != *self;
        if changed {
            merged.source = incoming.source;
        }

        Merge { record: merged, changed, status_conflict, cleared_unconfirmed }
    }
}

fn fill_if_empty(target: &mut String, value: &str) {
    if target.is_empty() && !value.is_empty() {
        value.clone_into(target);
    }
}

/// Result of [`TransactionRecord::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merge {
    /// The merged record.
    pub record: TransactionRecord,
    /// Whether the merged record differs from the stored one.
    pub changed: bool,
    /// Set when both sides carried different terminal statuses.
    pub status_conflict: Option<StatusConflict>,
    /// Whether a listener observation lowered the unconfirmed flag.
    pub cleared_unconfirmed: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn gateway(tx_id: &str, status: ValidationStatus) -> TransactionRecord {
        TransactionRecord::builder()
            .tx_id(tx_id)
            .channel("mychannel")
            .function("CreateAsset")
            .args(vec!["asset1".into()])
            .status(status)
            .ingested_at(t0())
            .source(RecordSource::Gateway)
            .build()
    }

    fn listener(tx_id: &str, status: ValidationStatus, block: u64) -> TransactionRecord {
        TransactionRecord::builder()
            .tx_id(tx_id)
            .channel("mychannel")
            .chaincode("basic")
            .block_number(block)
            .tx_index(2)
            .status(status)
            .validation_code(if status == ValidationStatus::Valid { 0 } else { 10 })
            .function("CreateAsset")
            .args(vec!["asset1".into()])
            .ledger_time(t0() + Duration::milliseconds(500))
            .ingested_at(t0() + Duration::seconds(1))
            .source(RecordSource::Listener)
            .build()
    }

    #[test]
    fn test_gateway_then_listener_fills_block_and_switches_source() {
        let stored = gateway("tx3", ValidationStatus::Valid);
        let merge = stored.merge(&listener("tx3", ValidationStatus::Valid, 7));

        assert!(merge.changed);
        assert!(merge.status_conflict.is_none());
        let record = merge.record;
        assert_eq!(record.block_number, Some(7));
        assert_eq!(record.tx_index, Some(2));
        assert_eq!(record.chaincode, "basic");
        assert_eq!(record.source, RecordSource::Listener);
        assert_eq!(record.ingested_at, t0());
        assert_eq!(record.commit_timestamp(), t0() + Duration::milliseconds(500));
        assert_eq!(
            record.observed_by,
            BTreeSet::from([RecordSource::Listener, RecordSource::Gateway])
        );
        assert_eq!(record.history.len(), 1);
    }

    #[test]
    fn test_unknown_then_terminal_appends_history() {
        let stored = listener("tx1", ValidationStatus::Unknown, 3);
        let merge = stored.merge(&gateway("tx1", ValidationStatus::Invalid));

        assert_eq!(merge.record.status, ValidationStatus::Invalid);
        assert_eq!(merge.record.history.len(), 2);
        assert_eq!(merge.record.history[1].source, RecordSource::Gateway);
        assert_eq!(merge.record.block_number, Some(3));
    }

    #[test]
    fn test_terminal_never_regresses_to_unknown() {
        let stored = listener("tx1", ValidationStatus::Valid, 3);
        let merge = stored.merge(&gateway("tx1", ValidationStatus::Unknown));

        assert_eq!(merge.record.status, ValidationStatus::Valid);
        assert!(merge.status_conflict.is_none());
    }

    #[test]
    fn test_contradictory_terminal_kept_and_reported() {
        let stored = gateway("tx1", ValidationStatus::Valid);
        let merge = stored.merge(&listener("tx1", ValidationStatus::Invalid, 4));

        assert_eq!(merge.record.status, ValidationStatus::Valid);
        assert_eq!(
            merge.status_conflict,
            Some(StatusConflict {
                stored: ValidationStatus::Valid,
                incoming: ValidationStatus::Invalid,
                incoming_source: RecordSource::Listener,
            })
        );
    }

    #[test]
    fn test_identical_merge_changes_nothing() {
        let stored = listener("tx1", ValidationStatus::Valid, 3);
        let merge = stored.merge(&stored.clone());

        assert!(!merge.changed);
        assert_eq!(merge.record, stored);
    }

    #[test]
    fn test_gateway_does_not_override_listener_block() {
        let stored = listener("tx1", ValidationStatus::Valid, 3);
        let mut incoming = gateway("tx1", ValidationStatus::Valid);
        incoming.block_number = Some(99);
        incoming.tx_index = Some(40);

        let merge = stored.merge(&incoming);
        assert_eq!(merge.record.block_number, Some(3));
        assert_eq!(merge.record.tx_index, Some(2));
    }

    #[test]
    fn test_record_without_tx_index_deserializes() {
        let mut value = serde_json::to_value(gateway("tx1", ValidationStatus::Valid)).unwrap();
        value.as_object_mut().unwrap().remove("tx_index");

        let record: TransactionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(record.tx_index, None);
    }

    #[test]
    fn test_listener_clears_unconfirmed() {
        let mut stored = gateway("tx4", ValidationStatus::Valid);
        stored.unconfirmed = true;

        let from_gateway = stored.merge(&gateway("tx4", ValidationStatus::Valid));
        assert!(!from_gateway.cleared_unconfirmed);
        assert!(from_gateway.record.unconfirmed);

        let from_listener = stored.merge(&listener("tx4", ValidationStatus::Valid, 12));
        assert!(from_listener.cleared_unconfirmed);
        assert!(!from_listener.record.unconfirmed);
        assert_eq!(from_listener.record.block_number, Some(12));
    }

    #[test]
    fn test_serde_round_trip_is_deterministic() {
        let record = listener("tx1", ValidationStatus::Valid, 3);
        let first = serde_json::to_vec(&record).unwrap();
        let decoded: TransactionRecord = serde_json::from_slice(&first).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(serde_json::to_vec(&decoded).unwrap(), first);
    }

    fn arb_status() -> impl Strategy<Value = ValidationStatus> {
        prop_oneof![
            Just(ValidationStatus::Unknown),
            Just(ValidationStatus::Valid),
            Just(ValidationStatus::Invalid),
        ]
    }

    fn arb_record() -> impl Strategy<Value = TransactionRecord> {
        (arb_status(), any::<bool>(), proptest::option::of(0u64..100), 0i64..60).prop_map(
            |(status, from_listener, block, offset)| {
                let source =
                    if from_listener { RecordSource::Listener } else { RecordSource::Gateway };
                TransactionRecord::builder()
                    .tx_id("tx")
                    .status(status)
                    .maybe_block_number(block)
                    .ingested_at(t0() + Duration::seconds(offset))
                    .source(source)
                    .build()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_status_is_monotonic(records in proptest::collection::vec(arb_record(), 1..12)) {
            let mut stored = records[0].clone();
            for incoming in &records[1..] {
                let before = stored.status;
                stored = stored.merge(incoming).record;
                if before.is_terminal() {
                    prop_assert_eq!(stored.status, before);
                }
            }
            let terminal_changes =
                stored.history.iter().filter(|c| c.status.is_terminal()).count();
            prop_assert!(terminal_changes <= 1);
        }

        #[test]
        fn prop_merge_is_idempotent(a in arb_record(), b in arb_record()) {
            let once = a.merge(&b).record;
            let twice = once.merge(&b);
            prop_assert!(!twice.changed);
            prop_assert_eq!(twice.record, once);
        }
    }
}
