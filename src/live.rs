//! The global event subscription: one live feed of the whole log, fanned
//! out to every registered [`EventObserver`].
//!
//! The feed only runs while every observer reports itself active. Each
//! non-system event is handed to all observers concurrently; once they all
//! succeed the event's position becomes the new global checkpoint, so a
//! restart resumes right after the last fully observed event.
//!
//! Use [`GlobalSubscription::start`] to spawn the loop and the returned
//! [`LiveHandle`] to stop it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use futures::future::{join_all, select_all};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::codec::{EventCodec, is_system_stream};
use crate::error::{Error, Result};
use crate::replay::ReceivedEvent;
use crate::stream::{MessageStream, StreamMessage, StreamStore, cancellable};
use crate::subscription::PersistentSubscriptionManager;

/// Subscription name used in logs and drop errors.
const GLOBAL_SUBSCRIPTION_NAME: &str = "global";

/// When the global failure counter goes back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureReset {
    /// Never: `max_failures` is a budget for the whole lifetime of the loop.
    #[default]
    Never,
    /// After every successfully observed event.
    OnDelivery,
}

/// Configuration for the global subscription loop.
///
/// # Examples
///
/// ```
/// use eventfold_sourcing::{FailureReset, LiveConfig};
///
/// let config = LiveConfig {
///     failure_reset: FailureReset::OnDelivery,
///     ..LiveConfig::default()
/// };
/// assert_eq!(config.max_failures, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConfig {
    /// Number of drops after which the loop gives up for good.
    ///
    /// Default: 5.
    pub max_failures: u32,

    /// Whether successful deliveries forgive earlier drops.
    ///
    /// Default: [`FailureReset::Never`].
    pub failure_reset: FailureReset,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            failure_reset: FailureReset::Never,
        }
    }
}

/// A consumer of the global event feed.
///
/// Observers gate the feed through [`activity`](EventObserver::activity):
/// events flow only while every observer's flag reads `true`. An observer
/// that is still warming up keeps its flag at `false` and flips it once
/// ready; [`ActivityFlag`] is a ready-made implementation.
#[async_trait::async_trait]
pub trait EventObserver: Send + Sync {
    /// Handle one event of the global log.
    ///
    /// # Errors
    ///
    /// An error drops the feed; after a reconnect the event is delivered
    /// again to every observer.
    async fn event_received(&self, received: ReceivedEvent, cancel: &CancellationToken) -> Result<()>;

    /// Receiver tracking whether this observer is ready for events.
    fn activity(&self) -> watch::Receiver<bool>;
}

/// Shared on/off switch backing [`EventObserver::activity`].
///
/// `Clone` is cheap and all clones flip the same flag.
#[derive(Debug, Clone)]
pub struct ActivityFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl ActivityFlag {
    /// Create a flag in the given state.
    pub fn new(active: bool) -> Self {
        let (tx, _rx) = watch::channel(active);
        Self { tx: Arc::new(tx) }
    }

    /// Change the state. Watchers are only woken on an actual change.
    pub fn set_active(&self, active: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
    }

    /// Current state.
    pub fn is_active(&self) -> bool {
        *self.tx.borrow()
    }

    /// A receiver to hand out from [`EventObserver::activity`].
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Handle for controlling the global subscription loop.
///
/// Dropping the handle does **not** stop the loop; call
/// [`shutdown`](LiveHandle::shutdown).
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct LiveHandle {
    /// Cancelled to stop the loop and any in-flight store call.
    pub(crate) shutdown: CancellationToken,
    /// `true` while a store subscription is open.
    pub(crate) live: Arc<AtomicBool>,
    /// Drops counted so far.
    pub(crate) failures: Arc<AtomicU32>,
    /// The spawned loop, taken and awaited exactly once by
    /// [`shutdown`](LiveHandle::shutdown).
    pub(crate) task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<()>>>>>,
}

impl std::fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHandle")
            .field("live", &self.is_live())
            .field("failures", &self.failures())
            .finish()
    }
}

impl LiveHandle {
    /// Returns `true` while events are flowing, i.e. the readiness gate is
    /// open and a store subscription is established.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Drops counted against [`LiveConfig::max_failures`].
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// Calling `shutdown` more than once is safe; later calls return
    /// `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns the loop's terminal error if it had already given up after
    /// exhausting its failure budget, or [`Error::Application`] if the task
    /// panicked.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            join_handle
                .await
                .map_err(|e| Error::Application(format!("global subscription task panicked: {e}")))?
        } else {
            Ok(())
        }
    }
}

/// Why one store subscription stopped being drained.
enum StreamOutcome {
    /// Shutdown was requested.
    Shutdown,
    /// An observer went inactive; resubscribe once the gate reopens.
    Paused,
    /// The feed failed and counts against the failure budget.
    Dropped(Error),
}

/// Builder and runner for the global subscription loop.
pub struct GlobalSubscription {
    store: Arc<dyn StreamStore>,
    codec: EventCodec,
    subscriptions: PersistentSubscriptionManager,
    observers: Vec<Arc<dyn EventObserver>>,
    config: LiveConfig,
}

impl std::fmt::Debug for GlobalSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalSubscription")
            .field("observers", &self.observers.len())
            .field("config", &self.config)
            .finish()
    }
}

impl GlobalSubscription {
    /// Create a loop reading through `store` and checkpointing through
    /// `subscriptions`.
    pub fn new(
        store: Arc<dyn StreamStore>,
        codec: EventCodec,
        subscriptions: PersistentSubscriptionManager,
        config: LiveConfig,
    ) -> Self {
        Self {
            store,
            codec,
            subscriptions,
            observers: Vec::new(),
            config,
        }
    }

    /// Register an observer.
    pub fn observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Spawn the loop onto the current tokio runtime.
    pub fn start(self) -> LiveHandle {
        let shutdown = CancellationToken::new();
        let live = Arc::new(AtomicBool::new(false));
        let failures = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(self.run(shutdown.clone(), Arc::clone(&live), Arc::clone(&failures)));
        LiveHandle {
            shutdown,
            live,
            failures,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Gate, subscribe, drain and reconnect until shut down or out of
    /// failure budget.
    async fn run(
        self,
        cancel: CancellationToken,
        live: Arc<AtomicBool>,
        failures: Arc<AtomicU32>,
    ) -> Result<()> {
        if self.observers.is_empty() {
            tracing::info!("global subscription: no observers registered, not starting");
            return Ok(());
        }
        let mut activity: Vec<watch::Receiver<bool>> =
            self.observers.iter().map(|o| o.activity()).collect();

        loop {
            if !wait_until_all_active(&mut activity, &cancel).await {
                return Ok(());
            }

            let outcome = match self.subscribe(&cancel).await {
                Ok(stream) => {
                    live.store(true, Ordering::Release);
                    let outcome = self.drain(stream, &mut activity, &failures, &cancel).await;
                    live.store(false, Ordering::Release);
                    outcome
                }
                Err(Error::Cancelled) => StreamOutcome::Shutdown,
                Err(e) => StreamOutcome::Dropped(e),
            };

            match outcome {
                StreamOutcome::Shutdown | StreamOutcome::Dropped(Error::Cancelled) => {
                    tracing::info!("global subscription: shut down");
                    return Ok(());
                }
                StreamOutcome::Paused => {
                    tracing::info!("global subscription: observer inactive, pausing");
                }
                StreamOutcome::Dropped(e) => {
                    let count = failures.fetch_add(1, Ordering::AcqRel) + 1;
                    let dropped = Error::SubscriptionDropped {
                        name: GLOBAL_SUBSCRIPTION_NAME.to_owned(),
                        reason: e.to_string(),
                    };
                    if count >= self.config.max_failures {
                        tracing::error!(
                            failures = count,
                            error = %dropped,
                            "global subscription: failure budget exhausted, stopping"
                        );
                        return Err(dropped);
                    }
                    tracing::warn!(
                        failures = count,
                        error = %dropped,
                        "global subscription: dropped, resubscribing"
                    );
                }
            }
        }
    }

    /// Reload the durable checkpoint and open a store subscription after it.
    async fn subscribe(&self, cancel: &CancellationToken) -> Result<MessageStream> {
        let after = self.subscriptions.load_global_checkpoint(cancel).await?;
        tracing::info!(?after, "global subscription: subscribing");
        cancellable(cancel, self.store.subscribe_to_all(after)).await
    }

    async fn drain(
        &self,
        mut stream: MessageStream,
        activity: &mut [watch::Receiver<bool>],
        failures: &AtomicU32,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamOutcome::Shutdown,
                _ = wait_for_deactivation(activity) => return StreamOutcome::Paused,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(message)) => {
                    if let Err(e) = self.deliver(&message, cancel).await {
                        return StreamOutcome::Dropped(e);
                    }
                    if self.config.failure_reset == FailureReset::OnDelivery {
                        failures.store(0, Ordering::Release);
                    }
                }
                Some(Err(e)) => return StreamOutcome::Dropped(e),
                None => return StreamOutcome::Dropped(Error::Store("stream ended".into())),
            }
        }
    }

    /// Fan one message out to every observer, then checkpoint it.
    async fn deliver(&self, message: &StreamMessage, cancel: &CancellationToken) -> Result<()> {
        // Checkpoint writes land in system streams; saving on them would loop.
        if is_system_stream(message) {
            tracing::trace!(
                stream_id = %message.stream_id,
                position = message.position,
                "global subscription: skipping system stream message"
            );
            return Ok(());
        }

        let received = ReceivedEvent::decode(&self.codec, message)?;
        let deliveries = self
            .observers
            .iter()
            .map(|observer| observer.event_received(received.clone(), cancel));
        let results = cancellable(cancel, async { Ok(join_all(deliveries).await) }).await?;
        for result in results {
            result?;
        }

        self.subscriptions
            .save_global_checkpoint(Some(message.position), cancel)
            .await?;
        tracing::debug!(
            position = message.position,
            event_type = received.event.event_type(),
            "global subscription: event observed"
        );
        Ok(())
    }
}

/// Wait until every flag reads `true` at the same time.
///
/// Returns `false` if `cancel` fires first.
async fn wait_until_all_active(
    activity: &mut [watch::Receiver<bool>],
    cancel: &CancellationToken,
) -> bool {
    loop {
        let states: Vec<bool> = activity
            .iter_mut()
            .map(|rx| *rx.borrow_and_update())
            .collect();
        if states.iter().all(|active| *active) {
            return true;
        }
        let changes = activity.iter_mut().map(|rx| {
            Box::pin(async move {
                // A dropped flag can never change again.
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            })
        });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = select_all(changes) => {}
        }
    }
}

/// Resolve once any flag reads `false`.
async fn wait_for_deactivation(activity: &mut [watch::Receiver<bool>]) {
    let waits = activity.iter_mut().map(|rx| {
        Box::pin(async move {
            let closed = rx.wait_for(|active| !*active).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        })
    });
    select_all(waits).await;
}
