//! In-process [`StreamStore`] backend.
//!
//! Keeps every stream in memory behind a `tokio::sync::RwLock` and fans new
//! messages out to subscribers through a `tokio::broadcast` channel. It
//! honours the full collaborator contract (optimistic concurrency, reverse
//! reads, `max_count` truncation, deletion, catch-up-then-live
//! subscriptions) and records every call it receives, which makes it the
//! backend of choice for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_stream::stream;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{RwLock, broadcast, watch};

use crate::error::{Error, Result};
use crate::stream::{
    AppendResult, ExpectedVersion, MessageStream, NewStreamMessage, ReadAllPage, ReadStreamPage,
    StreamMessage, StreamMetadata, StreamStore,
};

/// Default capacity of the live broadcast channel.
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Page size used when a subscription catches up from history.
const CATCHUP_BATCH_SIZE: usize = 500;

/// A call received by [`InMemoryStreamStore`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    /// `read_stream_forwards` starting at `from_version`.
    ReadForwards { stream_id: String, from_version: u64 },
    /// `read_stream_backwards` from the end of the stream.
    ReadBackwards { stream_id: String },
    /// `read_all_forwards` starting at `from_position`.
    ReadAll { from_position: u64 },
    /// `append_to_stream` of `count` messages at `expected`.
    Append {
        stream_id: String,
        expected: ExpectedVersion,
        count: usize,
    },
    /// `subscribe_to_stream` after `after_version`.
    SubscribeStream {
        stream_id: String,
        after_version: Option<u64>,
    },
    /// `subscribe_to_all` after `after_position`.
    SubscribeAll { after_position: Option<u64> },
    /// `delete_stream`.
    Delete { stream_id: String },
    /// `get_stream_metadata`.
    GetMetadata { stream_id: String },
    /// `set_stream_metadata` with the requested `max_count`.
    SetMetadata {
        stream_id: String,
        max_count: Option<u64>,
    },
}

#[derive(Debug, Default)]
struct StreamState {
    /// Retained messages, oldest first.
    messages: Vec<StreamMessage>,
    last_version: Option<u64>,
    max_count: Option<u64>,
    metadata_version: Option<u64>,
}

impl StreamState {
    fn exists(&self) -> bool {
        self.last_version.is_some()
    }
}

#[derive(Debug, Default)]
struct Log {
    streams: HashMap<String, StreamState>,
    /// Every retained message keyed by global position.
    all: BTreeMap<u64, StreamMessage>,
    next_position: u64,
}

impl Log {
    /// Drop messages beyond the stream's `max_count` from both indexes.
    fn truncate(&mut self, stream_id: &str) {
        let Some(state) = self.streams.get_mut(stream_id) else {
            return;
        };
        let Some(max) = state.max_count else {
            return;
        };
        let max = max as usize;
        if state.messages.len() > max {
            let excess = state.messages.len() - max;
            for removed in state.messages.drain(..excess) {
                self.all.remove(&removed.position);
            }
        }
    }
}

fn check_expected(
    stream_id: &str,
    expected: ExpectedVersion,
    actual: Option<u64>,
    exists: bool,
) -> Result<()> {
    let ok = match expected {
        ExpectedVersion::Any => true,
        ExpectedVersion::NoStream => !exists,
        ExpectedVersion::Exact(v) => actual == Some(v),
    };
    if ok {
        return Ok(());
    }
    Err(Error::ConcurrencyConflict {
        stream_id: stream_id.to_owned(),
        expected: expected.to_string(),
        actual: actual.map_or_else(|| "no stream".to_owned(), |v| v.to_string()),
    })
}

/// Outcome of waiting on the live half of a subscription.
enum LiveEvent {
    Message(std::result::Result<Arc<StreamMessage>, broadcast::error::RecvError>),
    Dropped,
}

/// A [`StreamStore`] held entirely in memory.
///
/// `Clone` is cheap: all state is `Arc`-wrapped, and clones share the same
/// log.
#[derive(Clone)]
pub struct InMemoryStreamStore {
    log: Arc<RwLock<Log>>,
    live_tx: broadcast::Sender<Arc<StreamMessage>>,
    drop_tx: Arc<watch::Sender<u64>>,
    calls: Arc<Mutex<Vec<StoreCall>>>,
}

impl std::fmt::Debug for InMemoryStreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStreamStore")
            .field("subscribers", &self.live_tx.receiver_count())
            .finish()
    }
}

impl Default for InMemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStreamStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_broadcast_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create an empty store whose live channel buffers `capacity`
    /// messages. Subscribers lagging further behind are dropped.
    pub fn with_broadcast_capacity(capacity: usize) -> Self {
        let (live_tx, _rx) = broadcast::channel(capacity.max(1));
        let (drop_tx, _drop_rx) = watch::channel(0u64);
        Self {
            log: Arc::new(RwLock::new(Log::default())),
            live_tx,
            drop_tx: Arc::new(drop_tx),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    /// Terminate every live subscription with an error, as a broken
    /// connection would.
    pub fn drop_subscriptions(&self) {
        self.drop_tx.send_modify(|generation| *generation += 1);
    }

    /// Number of messages currently retained in `stream_id`.
    pub async fn retained_count(&self, stream_id: &str) -> usize {
        let log = self.log.read().await;
        log.streams.get(stream_id).map_or(0, |s| s.messages.len())
    }

    fn record(&self, call: StoreCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    /// Build the catch-up-then-live stream shared by both subscription
    /// kinds. `filter` selects the messages the subscriber wants and
    /// `key` extracts the ordering key used to skip duplicates.
    fn subscription_stream(
        &self,
        after: Option<u64>,
        filter: impl Fn(&StreamMessage) -> bool + Send + 'static,
        key: fn(&StreamMessage) -> u64,
        read_batch: impl Fn(Arc<RwLock<Log>>, u64) -> BoxFuture<'static, Vec<StreamMessage>> + Send + 'static,
    ) -> MessageStream {
        // Register both receivers before reading history so nothing
        // appended in between is lost.
        let mut rx = self.live_tx.subscribe();
        let mut drop_rx = self.drop_tx.subscribe();
        let log = Arc::clone(&self.log);

        Box::pin(stream! {
            let mut cursor = after.map_or(0, |a| a + 1);
            let mut last_seen = after;

            loop {
                let batch = read_batch(Arc::clone(&log), cursor).await;
                let batch_len = batch.len();
                for message in batch {
                    last_seen = Some(key(&message));
                    cursor = key(&message) + 1;
                    yield Ok(message);
                }
                if batch_len < CATCHUP_BATCH_SIZE {
                    break;
                }
            }

            loop {
                let next = tokio::select! {
                    biased;
                    _ = drop_rx.changed() => LiveEvent::Dropped,
                    received = rx.recv() => LiveEvent::Message(received),
                };
                match next {
                    LiveEvent::Dropped => {
                        yield Err(Error::Store("subscription dropped by store".into()));
                        return;
                    }
                    LiveEvent::Message(Ok(message)) => {
                        if !filter(&message) {
                            continue;
                        }
                        if let Some(seen) = last_seen
                            && key(&message) <= seen
                        {
                            continue;
                        }
                        last_seen = Some(key(&message));
                        yield Ok(message.as_ref().clone());
                    }
                    LiveEvent::Message(Err(broadcast::error::RecvError::Lagged(_))) => {
                        yield Err(Error::Store(
                            "subscription lagged: resubscribe from last checkpoint".into(),
                        ));
                        return;
                    }
                    LiveEvent::Message(Err(broadcast::error::RecvError::Closed)) => {
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn read_stream_forwards(
        &self,
        stream_id: &str,
        from_version: u64,
        max_count: usize,
    ) -> Result<ReadStreamPage> {
        self.record(StoreCall::ReadForwards {
            stream_id: stream_id.to_owned(),
            from_version,
        });
        let log = self.log.read().await;
        let (messages, last_stream_version) = match log.streams.get(stream_id) {
            Some(state) => (
                state
                    .messages
                    .iter()
                    .filter(|m| m.stream_version >= from_version)
                    .take(max_count)
                    .cloned()
                    .collect::<Vec<_>>(),
                state.last_version,
            ),
            None => (Vec::new(), None),
        };
        let next_version = messages
            .last()
            .map_or(from_version, |m| m.stream_version + 1);
        let is_end = last_stream_version.is_none_or(|last| next_version > last);
        Ok(ReadStreamPage {
            stream_id: stream_id.to_owned(),
            from_version,
            next_version,
            last_stream_version,
            is_end,
            messages,
        })
    }

    async fn read_stream_backwards(
        &self,
        stream_id: &str,
        from_version: Option<u64>,
        max_count: usize,
    ) -> Result<ReadStreamPage> {
        self.record(StoreCall::ReadBackwards {
            stream_id: stream_id.to_owned(),
        });
        let log = self.log.read().await;
        let Some(state) = log.streams.get(stream_id) else {
            return Ok(ReadStreamPage {
                stream_id: stream_id.to_owned(),
                from_version: from_version.unwrap_or(0),
                next_version: 0,
                last_stream_version: None,
                is_end: true,
                messages: Vec::new(),
            });
        };
        let start = from_version.or(state.last_version).unwrap_or(0);
        let messages: Vec<StreamMessage> = state
            .messages
            .iter()
            .rev()
            .filter(|m| m.stream_version <= start)
            .take(max_count)
            .cloned()
            .collect();
        let oldest = messages.last().map(|m| m.stream_version);
        let is_end = match oldest {
            Some(v) => state.messages.first().is_none_or(|first| first.stream_version >= v),
            None => true,
        };
        Ok(ReadStreamPage {
            stream_id: stream_id.to_owned(),
            from_version: start,
            next_version: oldest.map_or(0, |v| v.saturating_sub(1)),
            last_stream_version: state.last_version,
            is_end,
            messages,
        })
    }

    async fn read_all_forwards(
        &self,
        from_position: u64,
        max_count: usize,
    ) -> Result<ReadAllPage> {
        self.record(StoreCall::ReadAll { from_position });
        let log = self.log.read().await;
        let messages: Vec<StreamMessage> = log
            .all
            .range(from_position..)
            .take(max_count)
            .map(|(_, m)| m.clone())
            .collect();
        let next_position = messages.last().map_or(from_position, |m| m.position + 1);
        let is_end = next_position >= log.next_position;
        Ok(ReadAllPage {
            from_position,
            next_position,
            is_end,
            messages,
        })
    }

    async fn append_to_stream(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
    ) -> Result<AppendResult> {
        self.record(StoreCall::Append {
            stream_id: stream_id.to_owned(),
            expected,
            count: messages.len(),
        });
        if stream_id.is_empty() {
            return Err(Error::InvalidArgument("stream id must not be empty".into()));
        }

        let mut log = self.log.write().await;
        let state = log.streams.get(stream_id);
        let actual = state.and_then(|s| s.last_version);
        check_expected(
            stream_id,
            expected,
            actual,
            state.is_some_and(StreamState::exists),
        )?;

        let now = Utc::now();
        let mut next_version = actual.map_or(0, |v| v + 1);
        let mut recorded = Vec::with_capacity(messages.len());
        for message in messages {
            let position = log.next_position;
            log.next_position += 1;
            recorded.push(StreamMessage {
                stream_id: stream_id.to_owned(),
                message_id: message.message_id,
                message_type: message.message_type,
                stream_version: next_version,
                position,
                created_utc: now,
                json_data: message.json_data,
                json_metadata: message.json_metadata,
            });
            next_version += 1;
        }

        let result = AppendResult {
            current_version: next_version.saturating_sub(1),
            current_position: recorded
                .last()
                .map_or(log.next_position.saturating_sub(1), |m| m.position),
        };

        for message in &recorded {
            log.all.insert(message.position, message.clone());
        }
        let state = log.streams.entry(stream_id.to_owned()).or_default();
        if !recorded.is_empty() {
            state.last_version = Some(result.current_version);
        }
        state.messages.extend(recorded.iter().cloned());
        log.truncate(stream_id);

        // Publishing under the write lock keeps live order equal to log order.
        for message in recorded {
            let _ = self.live_tx.send(Arc::new(message));
        }
        Ok(result)
    }

    async fn subscribe_to_stream(
        &self,
        stream_id: &str,
        after_version: Option<u64>,
        name: &str,
    ) -> Result<MessageStream> {
        self.record(StoreCall::SubscribeStream {
            stream_id: stream_id.to_owned(),
            after_version,
        });
        tracing::debug!(stream_id, name, ?after_version, "in-memory store: subscribing to stream");
        let wanted = stream_id.to_owned();
        let batch_stream = stream_id.to_owned();
        Ok(self.subscription_stream(
            after_version,
            move |m| m.stream_id == wanted,
            |m| m.stream_version,
            move |log, from| {
                let stream_id = batch_stream.clone();
                async move {
                    let log = log.read().await;
                    log.streams
                        .get(&stream_id)
                        .map(|s| {
                            s.messages
                                .iter()
                                .filter(|m| m.stream_version >= from)
                                .take(CATCHUP_BATCH_SIZE)
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default()
                }
                .boxed()
            },
        ))
    }

    async fn subscribe_to_all(&self, after_position: Option<u64>) -> Result<MessageStream> {
        self.record(StoreCall::SubscribeAll { after_position });
        Ok(self.subscription_stream(
            after_position,
            |_| true,
            |m| m.position,
            |log, from| {
                async move {
                    let log = log.read().await;
                    log.all
                        .range(from..)
                        .take(CATCHUP_BATCH_SIZE)
                        .map(|(_, m)| m.clone())
                        .collect()
                }
                .boxed()
            },
        ))
    }

    async fn delete_stream(&self, stream_id: &str, expected: ExpectedVersion) -> Result<()> {
        self.record(StoreCall::Delete {
            stream_id: stream_id.to_owned(),
        });
        let mut log = self.log.write().await;
        let state = log.streams.get(stream_id);
        check_expected(
            stream_id,
            expected,
            state.and_then(|s| s.last_version),
            state.is_some_and(StreamState::exists),
        )?;
        if let Some(state) = log.streams.remove(stream_id) {
            for message in state.messages {
                log.all.remove(&message.position);
            }
        }
        Ok(())
    }

    async fn get_stream_metadata(&self, stream_id: &str) -> Result<StreamMetadata> {
        self.record(StoreCall::GetMetadata {
            stream_id: stream_id.to_owned(),
        });
        let log = self.log.read().await;
        let state = log.streams.get(stream_id);
        Ok(StreamMetadata {
            stream_id: stream_id.to_owned(),
            max_count: state.and_then(|s| s.max_count),
            metadata_version: state.and_then(|s| s.metadata_version),
        })
    }

    async fn set_stream_metadata(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        max_count: Option<u64>,
    ) -> Result<()> {
        self.record(StoreCall::SetMetadata {
            stream_id: stream_id.to_owned(),
            max_count,
        });
        let mut log = self.log.write().await;
        let state = log.streams.entry(stream_id.to_owned()).or_default();
        let metadata_exists = state.metadata_version.is_some();
        check_expected(
            &format!("$${stream_id}"),
            expected,
            state.metadata_version,
            metadata_exists,
        )?;
        state.max_count = max_count;
        state.metadata_version = Some(state.metadata_version.map_or(0, |v| v + 1));
        log.truncate(stream_id);
        Ok(())
    }
}
