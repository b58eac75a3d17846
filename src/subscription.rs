//! Checkpointed subscriptions to category streams.
//!
//! [`PersistentSubscriptionManager::create_category_subscription`] catches
//! a handler up from the category's stored checkpoint, then keeps it live.
//! Every subscription is drained by its own task, so callbacks for one
//! subscription never overlap. After each delivered event the checkpoint
//! stream is advanced, which gives at-least-once delivery across restarts.
//!
//! Drops are retried from the last delivered version until the configured
//! retry budget is spent; the subscription then stays registered as
//! [`SubscriptionState::Dead`] until it is closed.
//!
//! A category's checkpoint stream belongs to one subscription at a time.
//! While a subscription to a category is registered, dead or alive, a
//! second one is refused; close the first to take the category over.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::codec::EventCodec;
use crate::config::EventSourcingConfig;
use crate::error::{Error, Result};
use crate::replay::{EventHandler, ReceivedEvent, ReplayManager};
use crate::stream::{
    ExpectedVersion, MessageStream, StreamMessage, StreamStore, cancellable,
};
use crate::stream_id::{GLOBAL_CHECKPOINT_ID, category_stream_id, checkpoint_stream_id};

/// Identifier returned by
/// [`create_category_subscription`](PersistentSubscriptionManager::create_category_subscription):
/// `{uuid}:{category stream id}`.
pub type SubscriptionId = String;

/// Lifecycle of a registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Receiving messages.
    Live,
    /// Dropped; a new store subscription is being opened.
    Reconnecting,
    /// Retry budget exhausted. Nothing more will be delivered.
    Dead,
}

/// Point-in-time view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStatus {
    /// Subscription id, also the name registered with the store.
    pub name: SubscriptionId,
    /// Category stream being followed.
    pub stream_id: String,
    /// Stream holding this subscription's checkpoint.
    pub checkpoint_stream_id: String,
    /// Drops counted so far. Never reset.
    pub failures: u32,
    /// Version of the last event delivered and checkpointed.
    pub last_version: Option<u64>,
    /// Current lifecycle state.
    pub state: SubscriptionState,
}

struct Registration {
    cancel: CancellationToken,
    status: watch::Receiver<SubscriptionStatus>,
}

struct Inner {
    store: Arc<dyn StreamStore>,
    codec: EventCodec,
    replay: ReplayManager,
    checkpoints: CheckpointStore,
    config: EventSourcingConfig,
    registry: DashMap<SubscriptionId, Registration>,
    /// Category streams owned by a registered or starting subscription.
    claimed: DashSet<String>,
    global_checkpoint: watch::Sender<Option<u64>>,
    shutdown: CancellationToken,
}

/// Owns every category subscription of one process, plus the global
/// checkpoint.
///
/// `Clone` is cheap and clones share the same registry.
#[derive(Clone)]
pub struct PersistentSubscriptionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PersistentSubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentSubscriptionManager")
            .field("subscriptions", &self.inner.registry.len())
            .field("global_checkpoint", &self.global_checkpoint())
            .finish()
    }
}

impl PersistentSubscriptionManager {
    /// Create a manager reading and checkpointing through `store`.
    pub fn new(store: Arc<dyn StreamStore>, codec: EventCodec, config: EventSourcingConfig) -> Self {
        let (global_checkpoint, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                replay: ReplayManager::new(Arc::clone(&store), codec.clone(), config.clone()),
                checkpoints: CheckpointStore::new(Arc::clone(&store)),
                store,
                codec,
                config,
                registry: DashMap::new(),
                claimed: DashSet::new(),
                global_checkpoint,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe `handler` to the category stream of `category`.
    ///
    /// Replays from the stored checkpoint first, persists the new
    /// checkpoint if the replay moved it, then goes live from the
    /// caught-up version. The returned id is needed to
    /// [`close`](Self::close_subscription) the subscription.
    ///
    /// # Arguments
    ///
    /// * `category` - Category name, with or without the `@ce-` prefix.
    /// * `handler` - Receives every event, one at a time.
    /// * `cancel` - Aborts the setup phase. The live subscription itself is
    ///   stopped by closing it or by [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Application`] without touching the store if the
    /// category already has a registered subscription.
    ///
    /// Replay, decode, handler and store errors during setup propagate. If
    /// the checkpoint stream did not exist before the call, it is deleted
    /// before the error is returned.
    pub async fn create_category_subscription<H>(
        &self,
        category: &str,
        handler: H,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId>
    where
        H: EventHandler + 'static,
    {
        let stream_id = category_stream_id(category)?;
        let checkpoint_stream = checkpoint_stream_id(&stream_id)?;
        if !self.inner.claimed.insert(stream_id.clone()) {
            return Err(Error::Application(format!(
                "category stream '{stream_id}' already has a subscription"
            )));
        }

        let checkpoint = match self.inner.checkpoints.read(&checkpoint_stream, cancel).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                self.inner.claimed.remove(&stream_id);
                return Err(e);
            }
        };

        let result = self
            .start(&stream_id, &checkpoint_stream, checkpoint, Arc::new(handler), cancel)
            .await;
        if let Err(e) = &result {
            tracing::error!(stream_id = %stream_id, error = %e, "failed to create subscription");
            if checkpoint.stream_version.is_none() {
                self.roll_back_checkpoint(&checkpoint_stream).await;
            }
            self.inner.claimed.remove(&stream_id);
        }
        result
    }

    async fn start(
        &self,
        stream_id: &str,
        checkpoint_stream: &str,
        checkpoint: CheckpointState,
        handler: Arc<dyn EventHandler>,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(Error::Application(
                "subscription manager has been shut down".into(),
            ));
        }

        let caught_up = inner
            .replay
            .replay_from_stream(stream_id, checkpoint.value, handler.as_ref(), cancel)
            .await?;

        inner
            .checkpoints
            .ensure_single_retention(checkpoint_stream, cancel)
            .await?;
        let mut expected = checkpoint.expected_version();
        if caught_up != checkpoint.value
            && let Some(value) = caught_up
        {
            inner
                .checkpoints
                .write(checkpoint_stream, expected, value, cancel)
                .await?;
            expected = expected.advanced_by(1);
        }

        let name = format!("{}:{stream_id}", Uuid::new_v4());
        let messages = cancellable(
            cancel,
            inner.store.subscribe_to_stream(stream_id, caught_up, &name),
        )
        .await?;

        let (status_tx, status_rx) = watch::channel(SubscriptionStatus {
            name: name.clone(),
            stream_id: stream_id.to_owned(),
            checkpoint_stream_id: checkpoint_stream.to_owned(),
            failures: 0,
            last_version: caught_up,
            state: SubscriptionState::Live,
        });
        let token = inner.shutdown.child_token();
        match inner.registry.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::Application(format!(
                    "subscription '{name}' is already registered"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Registration {
                    cancel: token.clone(),
                    status: status_rx,
                });
            }
        }

        let worker = SubscriptionWorker {
            store: Arc::clone(&inner.store),
            codec: inner.codec.clone(),
            checkpoints: inner.checkpoints.clone(),
            handler,
            name: name.clone(),
            stream_id: stream_id.to_owned(),
            checkpoint_stream_id: checkpoint_stream.to_owned(),
            retry_count: inner.config.subscription_retry_count,
            expected,
            last_version: caught_up,
            failures: 0,
            status: status_tx,
            cancel: token,
        };
        tokio::spawn(worker.run(messages));

        tracing::info!(
            subscription = %name,
            ?caught_up,
            "category subscription live"
        );
        Ok(name)
    }

    async fn roll_back_checkpoint(&self, checkpoint_stream: &str) {
        // The caller's token may be what failed the setup; clean up regardless.
        let cleanup = CancellationToken::new();
        match self.inner.checkpoints.delete(checkpoint_stream, &cleanup).await {
            Ok(()) => tracing::info!(checkpoint_stream, "rolled back checkpoint stream"),
            Err(e) => tracing::error!(
                checkpoint_stream,
                error = %e,
                "failed to roll back checkpoint stream"
            ),
        }
    }

    /// Stop the subscription `id` and delete its checkpoint stream.
    ///
    /// Unknown ids are ignored.
    pub async fn close_subscription(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let Some((_, registration)) = self.inner.registry.remove(id) else {
            tracing::debug!(subscription = id, "close: subscription not registered");
            return Ok(());
        };
        registration.cancel.cancel();

        let descriptor = id.split_once(':').map_or(id, |(_, stream)| stream);
        let checkpoint_stream = checkpoint_stream_id(descriptor)?;
        let deleted = self.inner.checkpoints.delete(&checkpoint_stream, cancel).await;
        self.inner.claimed.remove(&registration.status.borrow().stream_id);
        deleted?;
        tracing::info!(subscription = id, checkpoint_stream = %checkpoint_stream, "subscription closed");
        Ok(())
    }

    /// Stop every subscription and clear the registry. Later calls to
    /// [`create_category_subscription`](Self::create_category_subscription)
    /// fail with [`Error::Application`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let count = self.inner.registry.len();
        self.inner.registry.clear();
        self.inner.claimed.clear();
        tracing::info!(count, "subscription manager shut down");
    }

    /// Status of subscription `id`, or `None` if it is not registered.
    pub fn subscription_status(&self, id: &str) -> Option<SubscriptionStatus> {
        self.inner
            .registry
            .get(id)
            .map(|registration| registration.status.borrow().clone())
    }

    /// Ids of every registered subscription, dead ones included.
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.inner
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Persist `value` as the checkpoint called `name`.
    pub async fn save_checkpoint(
        &self,
        value: u64,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.checkpoints.save(name, value, cancel).await
    }

    /// Read back the checkpoint called `name`.
    pub async fn load_checkpoint(&self, name: &str, cancel: &CancellationToken) -> Result<Option<u64>> {
        self.inner.checkpoints.load(name, cancel).await
    }

    /// Last global checkpoint saved or loaded by this manager.
    pub fn global_checkpoint(&self) -> Option<u64> {
        *self.inner.global_checkpoint.borrow()
    }

    /// Save the global checkpoint durably and cache it.
    ///
    /// `None` clears it: the cache is emptied and the checkpoint stream is
    /// deleted.
    pub async fn save_global_checkpoint(
        &self,
        value: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match value {
            Some(position) => {
                self.inner
                    .checkpoints
                    .save(GLOBAL_CHECKPOINT_ID, position, cancel)
                    .await?;
            }
            None => {
                let stream_id = checkpoint_stream_id(GLOBAL_CHECKPOINT_ID)?;
                self.inner.checkpoints.delete(&stream_id, cancel).await?;
            }
        }
        self.inner.global_checkpoint.send_replace(value);
        Ok(())
    }

    /// Refresh the cached global checkpoint from its stream, e.g. after a
    /// restart.
    pub async fn load_global_checkpoint(&self, cancel: &CancellationToken) -> Result<Option<u64>> {
        let value = self
            .inner
            .checkpoints
            .load(GLOBAL_CHECKPOINT_ID, cancel)
            .await?;
        self.inner.global_checkpoint.send_replace(value);
        Ok(value)
    }
}

/// Drains one store subscription.
struct SubscriptionWorker {
    store: Arc<dyn StreamStore>,
    codec: EventCodec,
    checkpoints: CheckpointStore,
    handler: Arc<dyn EventHandler>,
    name: String,
    stream_id: String,
    checkpoint_stream_id: String,
    retry_count: u32,
    expected: ExpectedVersion,
    last_version: Option<u64>,
    failures: u32,
    status: watch::Sender<SubscriptionStatus>,
    cancel: CancellationToken,
}

impl SubscriptionWorker {
    async fn run(mut self, initial: MessageStream) {
        let mut messages = Some(initial);
        loop {
            if messages.is_none() {
                let subscribed = cancellable(
                    &self.cancel,
                    self.store
                        .subscribe_to_stream(&self.stream_id, self.last_version, &self.name),
                )
                .await;
                match subscribed {
                    Ok(stream) => {
                        messages = Some(stream);
                        self.set_state(SubscriptionState::Live);
                        tracing::info!(
                            subscription = %self.name,
                            after_version = ?self.last_version,
                            "subscription resumed"
                        );
                    }
                    Err(Error::Cancelled) => return,
                    Err(e) => {
                        if self.record_failure(e) {
                            continue;
                        }
                        return;
                    }
                }
            }
            let Some(stream) = messages.as_mut() else {
                continue;
            };

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                next = stream.next() => next,
            };
            let failure = match next {
                Some(Ok(message)) => match self.deliver(&message).await {
                    Ok(()) => continue,
                    Err(Error::Cancelled) => return,
                    Err(e) => e,
                },
                Some(Err(e)) => e,
                None => Error::Store("stream ended".into()),
            };
            messages = None;
            if !self.record_failure(failure) {
                return;
            }
        }
    }

    /// Hand one message to the handler, then advance the checkpoint.
    async fn deliver(&mut self, message: &StreamMessage) -> Result<()> {
        let received = ReceivedEvent::decode(&self.codec, message)?;
        cancellable(&self.cancel, self.handler.handle(received)).await?;
        self.checkpoints
            .write(
                &self.checkpoint_stream_id,
                self.expected,
                message.stream_version,
                &self.cancel,
            )
            .await?;
        self.expected = self.expected.advanced_by(1);
        self.last_version = Some(message.stream_version);
        let last_version = self.last_version;
        self.status.send_modify(|s| s.last_version = last_version);
        Ok(())
    }

    /// Count a drop. Returns `false` once the retry budget is spent.
    fn record_failure(&mut self, cause: Error) -> bool {
        self.failures += 1;
        let failures = self.failures;
        let dropped = Error::SubscriptionDropped {
            name: self.name.clone(),
            reason: cause.to_string(),
        };
        if failures > self.retry_count {
            tracing::error!(
                subscription = %self.name,
                failures,
                error = %dropped,
                "retry budget exhausted, subscription is dead"
            );
            self.status.send_modify(|s| {
                s.failures = failures;
                s.state = SubscriptionState::Dead;
            });
            return false;
        }
        tracing::warn!(
            subscription = %self.name,
            failures,
            error = %dropped,
            "subscription dropped, resubscribing"
        );
        self.status.send_modify(|s| {
            s.failures = failures;
            s.state = SubscriptionState::Reconnecting;
        });
        true
    }

    fn set_state(&self, state: SubscriptionState) {
        self.status.send_modify(|s| s.state = state);
    }
}
