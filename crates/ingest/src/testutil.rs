//! Test utilities for the ingestion pipeline.
//!
//! Feature-gated behind `testutil`.
//!
//! - [`BlockBuilder`] encodes blocks in the ledger's wire format.
//! - [`MockLedgerStream`] serves a scripted sequence of subscriptions, then a
//!   live chain of blocks.
//! - [`RecordingObserver`] keeps every [`PipelineEvent`] for assertions.
//! - [`wait_until`] polls a condition; pair it with paused Tokio time.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::watch;

use crate::{
    error::StreamError,
    listener::ListenerState,
    observer::{PipelineEvent, PipelineObserver},
    proto::{
        Block, BlockData, BlockHeader, BlockMetadata, ChaincodeActionPayload, ChaincodeId,
        ChaincodeInput, ChaincodeInvocationSpec, ChaincodeProposalPayload, ChaincodeSpec,
        ChannelHeader, Envelope, Header, HeaderType, Payload, Timestamp, Transaction,
        TransactionAction,
    },
    stream::{BlockEvent, BlockStream, LedgerStream},
};

/// Builds encoded blocks.
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use ledgersync_ingest::testutil::BlockBuilder;
///
/// let event = BlockBuilder::new(7)
///     .transaction("tx1", "CreateAsset", &["asset1", "blue"], 0)
///     .transaction("tx2", "TransferAsset", &["asset1", "bob"], 11)
///     .build();
/// assert_eq!(event.number, 7);
/// ```
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    number: u64,
    header_number: Option<u64>,
    channel: String,
    chaincode: String,
    timestamp: Option<DateTime<Utc>>,
    envelopes: Vec<Vec<u8>>,
    codes: Vec<u8>,
    with_filter: bool,
}

impl BlockBuilder {
    /// Starts an empty block on `mychannel` invoking chaincode `basic`.
    #[must_use]
    pub fn new(number: u64) -> Self {
        Self {
            number,
            header_number: None,
            channel: "mychannel".into(),
            chaincode: "basic".into(),
            timestamp: Some(Self::default_timestamp()),
            envelopes: Vec::new(),
            codes: Vec::new(),
            with_filter: true,
        }
    }

    /// Timestamp written into channel headers unless overridden.
    #[must_use]
    pub fn default_timestamp() -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600, 500).single().unwrap_or_default()
    }

    /// Sets the channel for envelopes added afterwards.
    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Sets the chaincode for envelopes added afterwards.
    #[must_use]
    pub fn chaincode(mut self, chaincode: impl Into<String>) -> Self {
        self.chaincode = chaincode.into();
        self
    }

    /// Sets the channel header timestamp for envelopes added afterwards.
    #[must_use]
    pub fn timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Writes `number` into the block header instead of the event number.
    #[must_use]
    pub fn header_number(mut self, number: u64) -> Self {
        self.header_number = Some(number);
        self
    }

    /// Adds an endorser transaction invoking `function` with `args`.
    #[must_use]
    pub fn transaction(self, tx_id: &str, function: &str, args: &[&str], code: u8) -> Self {
        let input = std::iter::once(function)
            .chain(args.iter().copied())
            .map(|arg| arg.as_bytes().to_vec())
            .collect();
        self.transaction_raw(tx_id, input, code)
    }

    /// Adds an endorser transaction with raw chaincode input, function first.
    #[must_use]
    pub fn transaction_raw(self, tx_id: &str, input: Vec<Vec<u8>>, code: u8) -> Self {
        let spec = ChaincodeSpec {
            r#type: 1,
            chaincode_id: Some(ChaincodeId { name: self.chaincode.clone(), ..ChaincodeId::default() }),
            input: Some(ChaincodeInput { args: input, is_init: false }),
            timeout: 0,
        };
        let invocation = ChaincodeInvocationSpec { chaincode_spec: Some(spec) };
        let proposal = ChaincodeProposalPayload { input: invocation.encode_to_vec() };
        let action_payload = ChaincodeActionPayload {
            chaincode_proposal_payload: proposal.encode_to_vec(),
            action: Vec::new(),
        };
        let transaction = Transaction {
            actions: vec![TransactionAction {
                header: Vec::new(),
                payload: action_payload.encode_to_vec(),
            }],
        };
        let envelope =
            self.envelope(HeaderType::EndorserTransaction, tx_id, transaction.encode_to_vec());
        self.raw_envelope(envelope, code)
    }

    /// Adds an endorser transaction that carries no actions.
    #[must_use]
    pub fn transaction_without_action(self, tx_id: &str) -> Self {
        let data = Transaction { actions: Vec::new() }.encode_to_vec();
        let envelope = self.envelope(HeaderType::EndorserTransaction, tx_id, data);
        self.raw_envelope(envelope, 0)
    }

    /// Adds a channel configuration envelope.
    #[must_use]
    pub fn config_update(self, code: u8) -> Self {
        let envelope = self.envelope(HeaderType::Config, "", b"config".to_vec());
        self.raw_envelope(envelope, code)
    }

    /// Adds pre-encoded envelope bytes.
    #[must_use]
    pub fn raw_envelope(mut self, envelope: Vec<u8>, code: u8) -> Self {
        self.envelopes.push(envelope);
        self.codes.push(code);
        self
    }

    /// Leaves the transactions filter out of the block metadata.
    #[must_use]
    pub fn without_filter(mut self) -> Self {
        self.with_filter = false;
        self
    }

    /// Encodes the block.
    #[must_use]
    pub fn build(self) -> BlockEvent {
        let metadata = if self.with_filter {
            vec![Vec::new(), Vec::new(), self.codes]
        } else {
            Vec::new()
        };
        let block = Block {
            header: Some(BlockHeader {
                number: self.header_number.unwrap_or(self.number),
                previous_hash: Vec::new(),
                data_hash: Vec::new(),
            }),
            data: Some(BlockData { data: self.envelopes }),
            metadata: Some(BlockMetadata { metadata }),
        };
        BlockEvent::new(self.number, block.encode_to_vec())
    }

    /// A block event whose payload is not a valid block.
    #[must_use]
    pub fn malformed(number: u64) -> BlockEvent {
        BlockEvent::new(number, vec![0xff, 0xff, 0xff, 0xff])
    }

    fn envelope(&self, kind: HeaderType, tx_id: &str, data: Vec<u8>) -> Vec<u8> {
        let channel_header = ChannelHeader {
            r#type: kind as i32,
            version: 0,
            timestamp: self.timestamp.map(|at| Timestamp {
                seconds: at.timestamp(),
                nanos: i32::try_from(at.timestamp_subsec_nanos()).unwrap_or(0),
            }),
            channel_id: self.channel.clone(),
            tx_id: tx_id.to_string(),
            epoch: 0,
        };
        let payload = Payload {
            header: Some(Header {
                channel_header: channel_header.encode_to_vec(),
                signature_header: Vec::new(),
            }),
            data,
        };
        Envelope { payload: payload.encode_to_vec(), signature: Vec::new() }.encode_to_vec()
    }
}

/// How a scripted subscription finishes after its blocks.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    /// The ledger closes the stream.
    Close,
    /// The stream stays open without delivering.
    Hang,
    /// The stream breaks with an error.
    Fail(StreamError),
}

/// One scripted answer to [`LedgerStream::subscribe`].
#[derive(Debug, Clone)]
pub enum Subscription {
    /// The call fails.
    Fail(StreamError),
    /// The call never returns.
    Stall,
    /// The call succeeds and the stream delivers exactly these blocks.
    Deliver(Vec<BlockEvent>, StreamEnd),
}

/// Scripted in-memory ledger.
///
/// Each subscription first consumes the next scripted [`Subscription`]. Once
/// the script is exhausted, subscriptions are served from the live chain:
/// every block at or above the requested start, then blocks appended with
/// [`push_block`](Self::push_block) as they arrive.
#[derive(Debug)]
pub struct MockLedgerStream {
    script: Mutex<VecDeque<Subscription>>,
    chain: watch::Sender<Vec<BlockEvent>>,
    subscriptions: Mutex<Vec<u64>>,
}

impl Default for MockLedgerStream {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            chain: watch::channel(Vec::new()).0,
            subscriptions: Mutex::new(Vec::new()),
        }
    }
}

impl MockLedgerStream {
    /// Creates a ledger with an empty chain and no script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ledger whose chain holds `blocks`, in order.
    #[must_use]
    pub fn with_chain(blocks: impl IntoIterator<Item = BlockEvent>) -> Self {
        let ledger = Self::new();
        ledger.chain.send_modify(|chain| chain.extend(blocks));
        ledger
    }

    /// Appends scripted subscriptions.
    pub fn script(&self, subscriptions: impl IntoIterator<Item = Subscription>) {
        self.script.lock().extend(subscriptions);
    }

    /// Appends a block to the live chain, waking live subscribers.
    pub fn push_block(&self, block: BlockEvent) {
        self.chain.send_modify(|chain| chain.push(block));
    }

    /// Returns the start block of every subscription attempt, in order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<u64> {
        self.subscriptions.lock().clone()
    }

    fn live(&self, start_block: u64) -> BlockStream {
        let receiver = self.chain.subscribe();
        stream::unfold((receiver, start_block), |(mut receiver, next)| async move {
            loop {
                let found =
                    receiver.borrow_and_update().iter().find(|b| b.number >= next).cloned();
                if let Some(block) = found {
                    let following = block.number.saturating_add(1);
                    return Some((Ok(block), (receiver, following)));
                }
                if receiver.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl LedgerStream for MockLedgerStream {
    async fn subscribe(&self, start_block: u64) -> Result<BlockStream, StreamError> {
        self.subscriptions.lock().push(start_block);
        let scripted = self.script.lock().pop_front();

        match scripted {
            Some(Subscription::Fail(err)) => Err(err),
            Some(Subscription::Stall) => std::future::pending().await,
            Some(Subscription::Deliver(blocks, end)) => {
                let head = stream::iter(blocks.into_iter().map(Ok));
                Ok(match end {
                    StreamEnd::Close => head.boxed(),
                    StreamEnd::Hang => head.chain(stream::pending()).boxed(),
                    StreamEnd::Fail(err) => head.chain(stream::once(async move { Err(err) })).boxed(),
                })
            },
            None => Ok(self.live(start_block)),
        }
    }
}

/// Observer that keeps every event.
///
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl RecordingObserver {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().clone()
    }

    /// Returns [`PipelineEvent::name`] of every event so far.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(PipelineEvent::name).collect()
    }

    /// Returns how many events named `name` were seen.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|event| event.name() == name).count()
    }

    /// Returns the target state of every state change, in order.
    #[must_use]
    pub fn states(&self) -> Vec<ListenerState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    /// Returns the delay of every backoff, in order.
    #[must_use]
    pub fn backoff_delays(&self) -> Vec<Duration> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::BackingOff { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect()
    }

    /// Returns the number of every block processed, in order.
    #[must_use]
    pub fn processed_blocks(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::BlockProcessed { block, .. } => Some(*block),
                _ => None,
            })
            .collect()
    }
}

impl PipelineObserver for RecordingObserver {
    fn observe(&self, event: &PipelineEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Polls `condition` every 10ms until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within ten minutes of Tokio time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 600s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
