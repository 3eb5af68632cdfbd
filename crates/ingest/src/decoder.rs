//! Block decoding.
//!
//! [`decode_block`] turns a delivered [`BlockEvent`] into the ordered list of
//! chaincode invocations it commits. Envelopes are walked in block order and
//! matched positionally with the transactions filter in the block metadata,
//! which carries one validation code per envelope:
//!
//! | code           | status                      |
//! |----------------|-----------------------------|
//! | `0`            | [`ValidationStatus::Valid`] |
//! | `254` / absent | [`ValidationStatus::Unknown`] |
//! | anything else  | [`ValidationStatus::Invalid`] |
//!
//! Envelopes that are not endorser transactions (configuration updates) are
//! counted in [`DecodedBlock::skipped`] and still consume their filter slot.
//!
//! Decoding is pure: the same payload always yields the same candidates. The
//! coordinator stamps the ingestion time when it turns candidates into
//! records.

use chrono::{DateTime, Utc};
use ledgersync_storage::{RecordSource, TransactionRecord, ValidationStatus};
use prost::Message;

use crate::{
    error::DecodeError,
    proto::{
        self, ChaincodeActionPayload, ChaincodeInvocationSpec, ChaincodeProposalPayload,
        ChannelHeader, Envelope, HeaderType, Payload, Transaction,
    },
    stream::BlockEvent,
};

/// Validation code of a committed, valid transaction.
pub const VALID_CODE: u8 = 0;

/// Validation code of a transaction the committer has not validated yet.
pub const NOT_VALIDATED_CODE: u8 = 254;

/// Maps a transactions-filter entry to a status.
#[must_use]
pub fn status_for_code(code: Option<u8>) -> ValidationStatus {
    match code {
        Some(VALID_CODE) => ValidationStatus::Valid,
        None | Some(NOT_VALIDATED_CODE) => ValidationStatus::Unknown,
        Some(_) => ValidationStatus::Invalid,
    }
}

/// A transaction found in a block, not yet stamped with an ingestion time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCandidate {
    /// Transaction id from the channel header.
    pub tx_id: String,
    /// Channel from the channel header.
    pub channel: String,
    /// Invoked chaincode name.
    pub chaincode: String,
    /// Block the transaction was committed in.
    pub block_number: u64,
    /// Position of the envelope within the block, counting skipped ones.
    pub tx_index: u32,
    /// Status resolved from the transactions filter.
    pub status: ValidationStatus,
    /// Raw transactions-filter entry, when present.
    pub validation_code: Option<i32>,
    /// Invoked function.
    pub function: String,
    /// Function arguments.
    pub args: Vec<String>,
    /// Channel header timestamp, when present and in range.
    pub ledger_time: Option<DateTime<Utc>>,
}

impl TransactionCandidate {
    /// Converts the candidate into a listener-sourced record first seen at
    /// `ingested_at`.
    #[must_use]
    pub fn into_record(self, ingested_at: DateTime<Utc>) -> TransactionRecord {
        TransactionRecord::builder()
            .tx_id(self.tx_id)
            .channel(self.channel)
            .chaincode(self.chaincode)
            .block_number(self.block_number)
            .tx_index(self.tx_index)
            .status(self.status)
            .maybe_validation_code(self.validation_code)
            .function(self.function)
            .args(self.args)
            .maybe_ledger_time(self.ledger_time)
            .ingested_at(ingested_at)
            .source(RecordSource::Listener)
            .build()
    }
}

/// Result of decoding one block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedBlock {
    /// Block number, as confirmed by the block header.
    pub number: u64,
    /// Endorser transactions in block order.
    pub candidates: Vec<TransactionCandidate>,
    /// Number of envelopes that were not endorser transactions.
    pub skipped: usize,
}

/// Decodes `event` into its transaction candidates.
///
/// # Errors
///
/// Returns [`DecodeError`] if any part of the block is structurally
/// malformed. A malformed envelope fails the whole block.
pub fn decode_block(event: &BlockEvent) -> Result<DecodedBlock, DecodeError> {
    let block = proto::Block::decode(event.payload.as_ref()).map_err(DecodeError::protobuf("block"))?;

    let header = block.header.ok_or(DecodeError::MissingField { field: "block header" })?;
    if header.number != event.number {
        return Err(DecodeError::BlockNumberMismatch { header: header.number, event: event.number });
    }

    let filter = block
        .metadata
        .and_then(|mut metadata| {
            (metadata.metadata.len() > proto::TRANSACTIONS_FILTER_INDEX)
                .then(|| metadata.metadata.swap_remove(proto::TRANSACTIONS_FILTER_INDEX))
        })
        .unwrap_or_default();

    let envelopes = block.data.map(|data| data.data).unwrap_or_default();
    let mut decoded = DecodedBlock { number: event.number, ..DecodedBlock::default() };

    for (index, raw) in envelopes.iter().enumerate() {
        let code = filter.get(index).copied();
        match decode_envelope(raw, index, event.number, code)? {
            Some(candidate) => decoded.candidates.push(candidate),
            None => decoded.skipped += 1,
        }
    }

    Ok(decoded)
}

/// Returns `None` for envelopes that carry no chaincode invocation.
fn decode_envelope(
    raw: &[u8],
    index: usize,
    block_number: u64,
    code: Option<u8>,
) -> Result<Option<TransactionCandidate>, DecodeError> {
    let envelope = Envelope::decode(raw).map_err(DecodeError::protobuf("envelope"))?;
    let payload =
        Payload::decode(envelope.payload.as_slice()).map_err(DecodeError::protobuf("payload"))?;
    let header = payload.header.ok_or(DecodeError::MissingField { field: "payload header" })?;
    let channel_header = ChannelHeader::decode(header.channel_header.as_slice())
        .map_err(DecodeError::protobuf("channel header"))?;

    if channel_header.r#type() != HeaderType::EndorserTransaction {
        return Ok(None);
    }
    if channel_header.tx_id.is_empty() {
        return Err(DecodeError::EmptyTransactionId { index });
    }

    let (chaincode, input) = decode_invocation(&payload.data, &channel_header.tx_id)?;
    let mut args = input.into_iter().map(|arg| String::from_utf8_lossy(&arg).into_owned());
    let function = args.next().unwrap_or_default();

    Ok(Some(TransactionCandidate {
        ledger_time: channel_header.timestamp.and_then(|ts| {
            u32::try_from(ts.nanos).ok().and_then(|nanos| DateTime::from_timestamp(ts.seconds, nanos))
        }),
        tx_id: channel_header.tx_id,
        channel: channel_header.channel_id,
        chaincode,
        block_number,
        tx_index: u32::try_from(index).unwrap_or(u32::MAX),
        status: status_for_code(code),
        validation_code: code.map(i32::from),
        function,
        args: args.collect(),
    }))
}

/// Extracts the chaincode name and raw input arguments of the first action.
fn decode_invocation(data: &[u8], tx_id: &str) -> Result<(String, Vec<Vec<u8>>), DecodeError> {
    let missing = || DecodeError::MissingChaincodeAction { tx_id: tx_id.to_string() };

    let transaction = Transaction::decode(data).map_err(DecodeError::protobuf("transaction"))?;
    let action = transaction.actions.into_iter().next().ok_or_else(missing)?;
    let action_payload = ChaincodeActionPayload::decode(action.payload.as_slice())
        .map_err(DecodeError::protobuf("chaincode action payload"))?;
    let proposal = ChaincodeProposalPayload::decode(
        action_payload.chaincode_proposal_payload.as_slice(),
    )
    .map_err(DecodeError::protobuf("chaincode proposal payload"))?;
    let invocation = ChaincodeInvocationSpec::decode(proposal.input.as_slice())
        .map_err(DecodeError::protobuf("chaincode invocation spec"))?;
    let spec = invocation.chaincode_spec.ok_or_else(missing)?;

    let chaincode = spec.chaincode_id.map(|id| id.name).unwrap_or_default();
    let args = spec.input.map(|input| input.args).unwrap_or_default();
    Ok((chaincode, args))
}
