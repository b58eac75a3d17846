//! Top-level entry point that composes persistence, projections, replay
//! and subscriptions over one [`StreamStore`] into a single [`EventStore`].
//!
//! The store is assembled with [`EventStoreBuilder`], which collects the
//! stream store backend, registered event types, projections, observers
//! and configuration.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::codec::{EventCodec, JsonSerializer, Serializer};
use crate::config::EventSourcingConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventRegistry};
use crate::headers::EventHeaders;
use crate::live::{EventObserver, GlobalSubscription, LiveConfig, LiveHandle};
use crate::persistence::EventPersistence;
use crate::projection::{CategoryProjection, Projection};
use crate::replay::{EventHandler, ReplayManager};
use crate::stream::StreamStore;
use crate::subscription::{PersistentSubscriptionManager, SubscriptionId, SubscriptionStatus};

/// Facade over every event-sourcing component sharing one stream store.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped, and clones share
/// the same save gate, category cache and subscription registry.
#[derive(Clone)]
pub struct EventStore {
    pub(crate) store: Arc<dyn StreamStore>,
    pub(crate) codec: EventCodec,
    pub(crate) config: EventSourcingConfig,
    pub(crate) persistence: Arc<EventPersistence>,
    pub(crate) replay: ReplayManager,
    pub(crate) subscriptions: PersistentSubscriptionManager,
    pub(crate) observers: Arc<Vec<Arc<dyn EventObserver>>>,
    pub(crate) live_config: LiveConfig,
    pub(crate) live_handle: Arc<tokio::sync::Mutex<Option<LiveHandle>>>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("config", &self.config)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl EventStore {
    /// Start building a store.
    pub fn builder() -> EventStoreBuilder {
        EventStoreBuilder::new()
    }

    /// Load aggregate `id`. See [`EventPersistence::get_by_id`].
    pub async fn get_by_id<A: Aggregate>(&self, id: Uuid, cancel: &CancellationToken) -> Result<A> {
        self.persistence.get_by_id(id, cancel).await
    }

    /// Save `aggregate`'s uncommitted events. See [`EventPersistence::save`].
    pub async fn save<A: Aggregate>(&self, aggregate: &mut A, cancel: &CancellationToken) -> Result<()> {
        self.persistence.save(aggregate, cancel).await
    }

    /// Save with caller headers merged into every envelope's metadata.
    pub async fn save_with_headers<A: Aggregate>(
        &self,
        aggregate: &mut A,
        headers: &EventHeaders,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.persistence
            .save_with_headers(aggregate, Some(headers), cancel)
            .await
    }

    /// Replay the global log. See [`ReplayManager::replay_from_global`].
    pub async fn replay_from_global(
        &self,
        checkpoint: Option<u64>,
        handler: &dyn EventHandler,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>> {
        self.replay
            .replay_from_global(checkpoint, handler, cancel)
            .await
    }

    /// Replay one stream. See [`ReplayManager::replay_from_stream`].
    pub async fn replay_from_stream(
        &self,
        stream_id: &str,
        checkpoint: Option<u64>,
        handler: &dyn EventHandler,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>> {
        self.replay
            .replay_from_stream(stream_id, checkpoint, handler, cancel)
            .await
    }

    /// Subscribe `handler` to a category. See
    /// [`PersistentSubscriptionManager::create_category_subscription`].
    pub async fn create_category_subscription<H>(
        &self,
        category: &str,
        handler: H,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId>
    where
        H: EventHandler + 'static,
    {
        self.subscriptions
            .create_category_subscription(category, handler, cancel)
            .await
    }

    /// Close a category subscription and delete its checkpoint.
    pub async fn close_subscription(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.subscriptions.close_subscription(id, cancel).await
    }

    /// Status of a category subscription.
    pub fn subscription_status(&self, id: &str) -> Option<SubscriptionStatus> {
        self.subscriptions.subscription_status(id)
    }

    /// Persist `value` as the checkpoint called `name`.
    pub async fn save_checkpoint(&self, value: u64, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.subscriptions.save_checkpoint(value, name, cancel).await
    }

    /// Read back the checkpoint called `name`, `None` if never saved.
    pub async fn load_checkpoint(&self, name: &str, cancel: &CancellationToken) -> Result<Option<u64>> {
        self.subscriptions.load_checkpoint(name, cancel).await
    }

    /// Save the global checkpoint; `None` clears it.
    pub async fn save_global_checkpoint(
        &self,
        value: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.subscriptions.save_global_checkpoint(value, cancel).await
    }

    /// Last global checkpoint saved or loaded by this store.
    pub fn global_checkpoint(&self) -> Option<u64> {
        self.subscriptions.global_checkpoint()
    }

    /// Reload the global checkpoint from its stream.
    pub async fn load_global_checkpoint(&self, cancel: &CancellationToken) -> Result<Option<u64>> {
        self.subscriptions.load_global_checkpoint(cancel).await
    }

    /// Start the global subscription in a background task.
    ///
    /// Observers registered on the builder receive every non-system event
    /// once all of them report active. Can only be called once per store.
    ///
    /// # Returns
    ///
    /// A [`LiveHandle`] for checking status and shutting down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Application`] if the global subscription is already
    /// running.
    pub async fn start_live(&self) -> Result<LiveHandle> {
        let mut guard = self.live_handle.lock().await;
        if guard.is_some() {
            return Err(Error::Application(
                "global subscription already started".into(),
            ));
        }

        let global = self.observers.iter().fold(
            GlobalSubscription::new(
                Arc::clone(&self.store),
                self.codec.clone(),
                self.subscriptions.clone(),
                self.live_config.clone(),
            ),
            |global, observer| global.observer(Arc::clone(observer)),
        );
        let handle = global.start();
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Stop the global subscription (if started) and every category
    /// subscription.
    ///
    /// # Errors
    ///
    /// Returns the global subscription's terminal error, if it had one.
    pub async fn shutdown(&self) -> Result<()> {
        self.subscriptions.shutdown();
        let handle = self.live_handle.lock().await.clone();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    /// The underlying stream store.
    pub fn stream_store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    /// The codec built from the registered event types.
    pub fn codec(&self) -> &EventCodec {
        &self.codec
    }

    /// The configuration the store was built with.
    pub fn config(&self) -> &EventSourcingConfig {
        &self.config
    }

    /// The category subscription manager.
    pub fn subscriptions(&self) -> &PersistentSubscriptionManager {
        &self.subscriptions
    }
}

/// Builder for configuring an [`EventStore`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_sourcing::{Event, EventStoreBuilder, InMemoryStreamStore};
///
/// #[derive(Debug, serde::Serialize, serde::Deserialize)]
/// struct Opened;
///
/// impl Event for Opened {
///     const EVENT_TYPE: &'static str = "Opened";
/// }
///
/// let store = EventStoreBuilder::new()
///     .store(Arc::new(InMemoryStreamStore::new()))
///     .event::<Opened>()
///     .build()
///     .expect("valid configuration");
/// assert!(store.codec().registry().contains("Opened", 0));
/// ```
pub struct EventStoreBuilder {
    store: Option<Arc<dyn StreamStore>>,
    registry: EventRegistry,
    registration_error: Option<Error>,
    serializer: Arc<dyn Serializer>,
    config: EventSourcingConfig,
    live_config: LiveConfig,
    projections: Vec<Arc<dyn Projection>>,
    category_projection: bool,
    observers: Vec<Arc<dyn EventObserver>>,
}

impl std::fmt::Debug for EventStoreBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStoreBuilder")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("category_projection", &self.category_projection)
            .finish()
    }
}

impl Default for EventStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStoreBuilder {
    /// Create a builder with default configuration and no event types.
    ///
    /// At minimum, [`store`](EventStoreBuilder::store) must be called
    /// before [`build`](EventStoreBuilder::build).
    pub fn new() -> Self {
        Self {
            store: None,
            registry: EventRegistry::new(),
            registration_error: None,
            serializer: Arc::new(JsonSerializer),
            config: EventSourcingConfig::default(),
            live_config: LiveConfig::default(),
            projections: Vec::new(),
            category_projection: true,
            observers: Vec::new(),
        }
    }

    /// Set the stream store backend.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn store(mut self, store: Arc<dyn StreamStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register event type `E` for decoding.
    ///
    /// Registration errors are reported by [`build`](EventStoreBuilder::build).
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn event<E: Event>(mut self) -> Self {
        if let Err(e) = self.registry.register::<E>()
            && self.registration_error.is_none()
        {
            self.registration_error = Some(e);
        }
        self
    }

    /// Replace the default [`JsonSerializer`].
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Set page size, checkpoint delta and retry budget.
    ///
    /// If not called, [`EventSourcingConfig::default()`] is used.
    pub fn config(mut self, config: EventSourcingConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the global subscription configuration.
    ///
    /// If not called, [`LiveConfig::default()`] is used.
    pub fn live_config(mut self, config: LiveConfig) -> Self {
        self.live_config = config;
        self
    }

    /// Add a projection notified after every save, after the built-in
    /// category projection.
    pub fn projection(mut self, projection: Arc<dyn Projection>) -> Self {
        self.projections.push(projection);
        self
    }

    /// Do not maintain `@ce-{Type}` category streams on save.
    pub fn without_category_projection(mut self) -> Self {
        self.category_projection = false;
        self
    }

    /// Add an observer of the global subscription started by
    /// [`EventStore::start_live`].
    pub fn observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validate the configuration and assemble the [`EventStore`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no store was set, an event type
    /// failed to register, or the configuration is invalid.
    pub fn build(self) -> Result<EventStore> {
        if let Some(e) = self.registration_error {
            return Err(e);
        }
        let store = self
            .store
            .ok_or_else(|| Error::Configuration("no stream store configured".into()))?;
        self.config.validate()?;

        let codec = EventCodec::with_serializer(self.registry, self.serializer);

        let mut projections: Vec<Arc<dyn Projection>> = Vec::new();
        if self.category_projection {
            projections.push(Arc::new(CategoryProjection::new(Arc::clone(&store))));
        }
        projections.extend(self.projections);

        let persistence = EventPersistence::new(
            Arc::clone(&store),
            codec.clone(),
            projections,
            self.config.clone(),
        );
        let replay = ReplayManager::new(Arc::clone(&store), codec.clone(), self.config.clone());
        let subscriptions = PersistentSubscriptionManager::new(
            Arc::clone(&store),
            codec.clone(),
            self.config.clone(),
        );

        tracing::debug!(
            event_types = codec.registry().len(),
            observers = self.observers.len(),
            "event store built"
        );
        Ok(EventStore {
            store,
            codec,
            config: self.config,
            persistence: Arc::new(persistence),
            replay,
            subscriptions,
            observers: Arc::new(self.observers),
            live_config: self.live_config,
            live_handle: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }
}
