//! The block listener.
//!
//! A [`Listener`] keeps one subscription to the ledger's block stream alive,
//! decodes every delivered block, hands its transactions to the
//! [`Coordinator`] and advances the persisted cursor.
//!
//! # State Machine
//!
//! ```text
//!                 run()
//!   Disconnected ────────► Connecting ──── subscribed ────► Streaming
//!        ▲                 │    ▲                               │
//!        │   fatal error   │    │ delay elapsed                 │ stream ended, stream error,
//!        ├─────────────────┘    │                               │ gap, store failure
//!        │                      │                               ▼
//!        │                      └─────────────────────────  BackingOff
//!        │                                                      ▲
//!        │                       transient subscribe failure    │
//!        │                  Connecting ─────────────────────────┘
//!        │
//!        └──── shutdown requested (from any state)
//! ```
//!
//! - **Connecting**: loads the cursor and subscribes from `cursor + 1` (or the
//!   configured start block when nothing has been processed yet), bounded by
//!   `subscribe_timeout`.
//! - **Streaming**: processes events one at a time in arrival order. Events
//!   at or below the cursor are ignored. An event beyond the next expected
//!   number is a gap and forces a resubscribe from the cursor.
//! - **BackingOff**: waits [`BackoffConfig::delay_for`] the number of
//!   consecutive failures. The count resets once a block is processed.
//!
//! The cursor is saved only after the coordinator accepted the block, so a
//! block is processed at least once and never skipped. A block that fails to
//! decode is reported and the cursor still moves past it.
//!
//! Shutdown is requested through a [`CancellationToken`]. Every wait point
//! observes it and the listener stops in `Disconnected` without saving the
//! cursor for a block whose acceptance was interrupted.
//!
//! [`BackoffConfig::delay_for`]: crate::BackoffConfig::delay_for

use std::{fmt, sync::Arc};

use futures::StreamExt;
use ledgersync_storage::{CursorStore, DedupStore};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ListenerConfig,
    coordinator::Coordinator,
    decoder::decode_block,
    error::{ListenerError, StreamError},
    observer::{NoopObserver, PipelineEvent, PipelineObserver},
    stream::{BlockEvent, BlockStream, LedgerStream},
};

/// Lifecycle state of a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    /// Not subscribed. Initial and terminal state.
    Disconnected,
    /// Loading the cursor and opening a subscription.
    Connecting,
    /// Consuming blocks.
    Streaming,
    /// Waiting before the next subscription attempt.
    BackingOff,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Streaming => write!(f, "streaming"),
            Self::BackingOff => write!(f, "backing_off"),
        }
    }
}

/// Outcome of one connection attempt.
enum Connect {
    Subscribed { stream: BlockStream, next_block: u64 },
    Failed,
    Fatal(ListenerError),
    Cancelled,
}

/// Why a subscription stopped delivering.
enum Interrupt {
    Resubscribe,
    Cancelled,
}

/// Outcome of processing one block.
enum Step {
    Accepted,
    Rejected,
    Cancelled,
}

/// Drives the subscribe, stream and back-off cycle for one channel.
pub struct Listener<L, C, S> {
    stream: L,
    cursor: C,
    coordinator: Arc<Coordinator<S>>,
    config: ListenerConfig,
    observer: Arc<dyn PipelineObserver>,
    token: CancellationToken,
    state: watch::Sender<ListenerState>,
}

impl<L, C, S> fmt::Debug for Listener<L, C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("channel", &self.config.channel)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl<L, C, S> Listener<L, C, S>
where
    L: LedgerStream,
    C: CursorStore,
    S: DedupStore,
{
    /// Creates a listener in the `Disconnected` state.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Config`] if `config` is invalid.
    #[builder]
    pub fn new(
        stream: L,
        cursor: C,
        coordinator: Arc<Coordinator<S>>,
        config: ListenerConfig,
        #[builder(default = Arc::new(NoopObserver) as Arc<dyn PipelineObserver>)]
        observer: Arc<dyn PipelineObserver>,
        #[builder(default)] token: CancellationToken,
    ) -> Result<Self, ListenerError> {
        config.validate()?;
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Ok(Self { stream, cursor, coordinator, config, observer, token, state })
    }
}

impl<L, C, S> Listener<L, C, S>
where
    L: LedgerStream,
    C: CursorStore,
    S: DedupStore,
{
    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Returns a receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Returns the token that stops the listener when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Runs until shutdown is requested or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// - [`ListenerError::Fatal`] if the ledger rejects the subscription in a
    ///   way retrying cannot fix.
    /// - [`ListenerError::Storage`] if the cursor cannot be read for a reason
    ///   other than a transient store failure.
    #[tracing::instrument(skip(self), fields(channel = %self.config.channel))]
    pub async fn run(&self) -> Result<(), ListenerError> {
        let mut failures: u32 = 0;

        let result = loop {
            if self.token.is_cancelled() {
                break Ok(());
            }

            self.transition(ListenerState::Connecting);
            match self.connect().await {
                Connect::Subscribed { stream, next_block } => {
                    self.transition(ListenerState::Streaming);
                    match self.consume(stream, next_block, &mut failures).await {
                        Interrupt::Resubscribe => {},
                        Interrupt::Cancelled => break Ok(()),
                    }
                },
                Connect::Failed => {},
                Connect::Fatal(err) => {
                    tracing::error!(error = %err, "listener halted");
                    break Err(err);
                },
                Connect::Cancelled => break Ok(()),
            }

            self.transition(ListenerState::BackingOff);
            let delay = self.config.backoff.delay_for(failures);
            failures = failures.saturating_add(1);
            self.observer.observe(&PipelineEvent::BackingOff { attempt: failures, delay });

            tokio::select! {
                biased;
                () = self.token.cancelled() => break Ok(()),
                () = tokio::time::sleep(delay) => {},
            }
        };

        self.transition(ListenerState::Disconnected);
        result
    }

    async fn connect(&self) -> Connect {
        let loaded = tokio::select! {
            biased;
            () = self.token.cancelled() => return Connect::Cancelled,
            loaded = self.cursor.load() => loaded,
        };

        let start_block = match loaded {
            Ok(Some(cursor)) => cursor.saturating_add(1),
            Ok(None) => self.config.start_block,
            Err(err) if err.is_transient() => {
                self.observer.observe(&PipelineEvent::CursorLoadFailed { error: err.to_string() });
                return Connect::Failed;
            },
            Err(err) => {
                self.observer.observe(&PipelineEvent::CursorLoadFailed { error: err.to_string() });
                return Connect::Fatal(ListenerError::Storage(err));
            },
        };

        let subscribed = tokio::select! {
            biased;
            () = self.token.cancelled() => return Connect::Cancelled,
            subscribed = tokio::time::timeout(
                self.config.subscribe_timeout,
                self.stream.subscribe(start_block),
            ) => subscribed,
        };

        match subscribed {
            Ok(Ok(stream)) => {
                self.observer.observe(&PipelineEvent::Subscribed { start_block });
                Connect::Subscribed { stream, next_block: start_block }
            },
            Ok(Err(error)) => {
                let transient = error.is_transient();
                self.observer
                    .observe(&PipelineEvent::SubscribeFailed { start_block, error: error.clone() });
                if transient { Connect::Failed } else { Connect::Fatal(ListenerError::Fatal(error)) }
            },
            Err(_) => {
                self.observer.observe(&PipelineEvent::SubscribeFailed {
                    start_block,
                    error: StreamError::Timeout,
                });
                Connect::Failed
            },
        }
    }

    async fn consume(
        &self,
        mut stream: BlockStream,
        mut next_block: u64,
        failures: &mut u32,
    ) -> Interrupt {
        loop {
            let item = tokio::select! {
                biased;
                () = self.token.cancelled() => return Interrupt::Cancelled,
                item = stream.next() => item,
            };

            let event = match item {
                Some(Ok(event)) => event,
                Some(Err(error)) => {
                    self.observer.observe(&PipelineEvent::StreamFailed { next_block, error });
                    return Interrupt::Resubscribe;
                },
                None => {
                    self.observer.observe(&PipelineEvent::StreamEnded { next_block });
                    return Interrupt::Resubscribe;
                },
            };

            if event.number < next_block {
                self.observer.observe(&PipelineEvent::BlockRedelivered {
                    block: event.number,
                    expected: next_block,
                });
                continue;
            }
            if event.number > next_block {
                self.observer
                    .observe(&PipelineEvent::BlockGap { block: event.number, expected: next_block });
                return Interrupt::Resubscribe;
            }

            match self.process(&event).await {
                Step::Accepted => {
                    *failures = 0;
                    next_block = event.number.saturating_add(1);
                },
                Step::Rejected => return Interrupt::Resubscribe,
                Step::Cancelled => return Interrupt::Cancelled,
            }
        }
    }

    #[tracing::instrument(skip(self, event), fields(block = event.number))]
    async fn process(&self, event: &BlockEvent) -> Step {
        let (candidates, skipped, decoded) = match decode_block(event) {
            Ok(decoded) => (decoded.candidates, decoded.skipped, true),
            Err(error) => {
                self.observer.observe(&PipelineEvent::DecodeFailed { block: event.number, error });
                (Vec::new(), 0, false)
            },
        };

        let accept = async {
            let receipt = self
                .coordinator
                .accept_block(event.number, candidates)
                .await
                .map_err(|err| format!("{err}: {}", err.source))?;
            self.cursor
                .save(event.number)
                .await
                .map_err(|err| format!("cursor save failed: {err}"))?;
            Ok::<_, String>(receipt)
        };

        let result = tokio::select! {
            biased;
            () = self.token.cancelled() => return Step::Cancelled,
            result = accept => result,
        };

        match result {
            Ok(receipt) => {
                if decoded {
                    self.observer.observe(&PipelineEvent::BlockProcessed {
                        block: event.number,
                        receipt,
                        skipped,
                    });
                }
                Step::Accepted
            },
            Err(error) => {
                self.observer.observe(&PipelineEvent::BlockRejected { block: event.number, error });
                Step::Rejected
            },
        }
    }

    fn transition(&self, to: ListenerState) {
        let from = self.state.send_replace(to);
        if from != to {
            self.observer.observe(&PipelineEvent::StateChanged { from, to });
        }
    }
}

impl<L, C, S> Listener<L, C, S>
where
    L: LedgerStream + 'static,
    C: CursorStore + 'static,
    S: DedupStore + 'static,
{
    /// Runs the listener on a dedicated task.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn spawn(self) -> ListenerHandle {
        let token = self.token.clone();
        let state = self.state.subscribe();
        let handle = tokio::spawn(async move { self.run().await });
        ListenerHandle { token, state, handle }
    }
}

/// Control handle for a spawned [`Listener`].
#[derive(Debug)]
pub struct ListenerHandle {
    token: CancellationToken,
    state: watch::Receiver<ListenerState>,
    handle: JoinHandle<Result<(), ListenerError>>,
}

impl ListenerHandle {
    /// Returns the listener's current state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Returns a receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    /// Returns `true` once the listener task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Requests shutdown and waits for the listener to stop.
    ///
    /// # Errors
    ///
    /// Returns the listener's error if it halted on its own before shutdown
    /// took effect.
    pub async fn shutdown(self) -> Result<(), ListenerError> {
        self.token.cancel();
        self.join().await
    }

    /// Waits for the listener to stop without requesting shutdown.
    ///
    /// # Errors
    ///
    /// Returns the listener's error, or [`ListenerError::Task`] if the task
    /// panicked.
    pub async fn join(self) -> Result<(), ListenerError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "listener task failed");
                Err(ListenerError::Task { message: err.to_string() })
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use ledgersync_storage::{BackendCursorStore, BackendDedupStore, ConfigError, MemoryBackend};

    use super::*;
    use crate::testutil::{MockLedgerStream, RecordingObserver, Subscription, wait_until};

    type TestListener = Listener<
        Arc<MockLedgerStream>,
        BackendCursorStore<MemoryBackend>,
        BackendDedupStore<MemoryBackend>,
    >;

    fn listener(stream: &Arc<MockLedgerStream>, observer: &RecordingObserver) -> TestListener {
        let coordinator = Coordinator::builder()
            .store(BackendDedupStore::builder().backend(MemoryBackend::new()).build())
            .build();
        Listener::builder()
            .stream(Arc::clone(stream))
            .cursor(BackendCursorStore::builder().backend(MemoryBackend::new()).build())
            .coordinator(Arc::new(coordinator))
            .config(ListenerConfig::builder().channel("mychannel").build().unwrap())
            .observer(Arc::new(observer.clone()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ListenerState::BackingOff.to_string(), "backing_off");
        assert_eq!(ListenerState::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let stream = Arc::new(MockLedgerStream::new());
        let config = ListenerConfig {
            channel: String::new(),
            ..ListenerConfig::builder().channel("c").build().unwrap()
        };
        let result: Result<TestListener, _> = Listener::builder()
            .stream(stream)
            .cursor(BackendCursorStore::builder().backend(MemoryBackend::new()).build())
            .coordinator(Arc::new(
                Coordinator::builder()
                    .store(BackendDedupStore::builder().backend(MemoryBackend::new()).build())
                    .build(),
            ))
            .config(config)
            .build();
        assert!(matches!(
            result,
            Err(ListenerError::Config(ConfigError::MissingField { field: "channel" }))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_run_before_connecting() {
        let stream = Arc::new(MockLedgerStream::new());
        let observer = RecordingObserver::new();
        let listener = listener(&stream, &observer);

        listener.cancel_token().cancel();
        listener.run().await.unwrap();

        assert!(stream.subscriptions().is_empty());
        assert!(observer.states().is_empty());
        assert_eq!(listener.state(), ListenerState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_listener_is_disconnected_and_shuts_down_cleanly() {
        let stream = Arc::new(MockLedgerStream::new());
        let observer = RecordingObserver::new();
        let listener = listener(&stream, &observer);
        assert_eq!(listener.state(), ListenerState::Disconnected);

        let handle = listener.spawn();
        wait_until(|| handle.state() == ListenerState::Streaming).await;

        handle.shutdown().await.unwrap();
        assert_eq!(
            observer.states(),
            [ListenerState::Connecting, ListenerState::Streaming, ListenerState::Disconnected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_subscribe_error_halts() {
        let stream = Arc::new(MockLedgerStream::new());
        stream.script([Subscription::Fail(StreamError::unauthorized("certificate revoked"))]);
        let observer = RecordingObserver::new();

        let result = listener(&stream, &observer).spawn().join().await;

        assert!(matches!(result, Err(ListenerError::Fatal(StreamError::Unauthorized { .. }))));
        assert_eq!(observer.states().last(), Some(&ListenerState::Disconnected));
        assert!(!observer.states().contains(&ListenerState::BackingOff));
        assert_eq!(stream.subscriptions(), [0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_is_immediate() {
        let stream = Arc::new(MockLedgerStream::new());
        stream.script([Subscription::Fail(StreamError::unavailable("down"))]);
        let observer = RecordingObserver::new();
        let handle = listener(&stream, &observer).spawn();

        wait_until(|| handle.state() == ListenerState::BackingOff).await;
        let started = tokio::time::Instant::now();
        handle.shutdown().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stream.subscriptions(), [0]);
    }
}
