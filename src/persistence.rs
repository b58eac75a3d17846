//! Loading and saving aggregates through their event streams.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::codec::EventCodec;
use crate::config::EventSourcingConfig;
use crate::error::{Error, Result};
use crate::headers::EventHeaders;
use crate::projection::Projection;
use crate::stream::{ExpectedVersion, StreamStore, cancellable};
use crate::stream_id::aggregate_stream_id;

/// Expected version for a save, given the aggregate's version and the
/// number of events it has not persisted yet.
///
/// A first save targets an empty stream; later saves target the version
/// right before the new batch.
///
/// # Examples
///
/// ```
/// use eventfold_sourcing::ExpectedVersion;
/// use eventfold_sourcing::persistence::expected_version_for_save;
///
/// assert_eq!(expected_version_for_save(2, 2), ExpectedVersion::NoStream);
/// assert_eq!(expected_version_for_save(5, 2), ExpectedVersion::Exact(2));
/// ```
pub fn expected_version_for_save(version: u64, uncommitted: usize) -> ExpectedVersion {
    let original_version = version.saturating_sub(uncommitted as u64);
    if original_version == 0 {
        ExpectedVersion::NoStream
    } else {
        ExpectedVersion::Exact(original_version - 1)
    }
}

/// Aggregate repository over a [`StreamStore`].
///
/// Saves are serialized by a single gate spanning the append and the
/// projection fan-out, so projections observe batches in append order.
/// Loads do not take the gate.
pub struct EventPersistence {
    store: Arc<dyn StreamStore>,
    codec: EventCodec,
    projections: Vec<Arc<dyn Projection>>,
    config: EventSourcingConfig,
    save_gate: Mutex<()>,
}

impl std::fmt::Debug for EventPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPersistence")
            .field("projections", &self.projections.len())
            .field("config", &self.config)
            .finish()
    }
}

impl EventPersistence {
    /// Create a repository.
    ///
    /// # Arguments
    ///
    /// * `store` - The stream store events are read from and appended to.
    /// * `codec` - Encoder/decoder for the registered event types.
    /// * `projections` - Notified after every successful append, in order.
    /// * `config` - Page size for loads.
    pub fn new(
        store: Arc<dyn StreamStore>,
        codec: EventCodec,
        projections: Vec<Arc<dyn Projection>>,
        config: EventSourcingConfig,
    ) -> Self {
        Self {
            store,
            codec,
            projections,
            config,
            save_gate: Mutex::new(()),
        }
    }

    /// Load aggregate `id` by replaying its whole stream.
    ///
    /// # Errors
    ///
    /// - [`Error::AggregateNotFound`] if the stream holds no events or the
    ///   aggregate factory rejects the history.
    /// - Any decode error from the codec; no partially built aggregate is
    ///   returned.
    /// - [`Error::Cancelled`] if `cancel` fires during a page read.
    pub async fn get_by_id<A: Aggregate>(&self, id: Uuid, cancel: &CancellationToken) -> Result<A> {
        let stream_id = aggregate_stream_id(A::AGGREGATE_TYPE, id)?;
        let started = Instant::now();

        let mut events = Vec::new();
        let mut next_version = 0u64;
        loop {
            let page = cancellable(
                cancel,
                self.store.read_stream_forwards(
                    &stream_id,
                    next_version,
                    self.config.max_read_stream_forward,
                ),
            )
            .await?;
            if page.messages.is_empty() {
                break;
            }
            for message in &page.messages {
                events.push(self.codec.from_envelope(message)?);
            }
            next_version = page.next_version;
        }

        if events.is_empty() {
            return Err(Error::AggregateNotFound { stream_id });
        }
        let count = events.len();
        let aggregate = A::from_events(events).ok_or_else(|| Error::AggregateNotFound {
            stream_id: stream_id.clone(),
        })?;
        tracing::debug!(
            stream_id = %stream_id,
            events = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded aggregate"
        );
        Ok(aggregate)
    }

    /// Persist the aggregate's uncommitted events.
    ///
    /// Equivalent to [`save_with_headers`](Self::save_with_headers) with no
    /// headers.
    pub async fn save<A: Aggregate>(&self, aggregate: &mut A, cancel: &CancellationToken) -> Result<()> {
        self.save_with_headers(aggregate, None, cancel).await
    }

    /// Persist the aggregate's uncommitted events, stamping `headers` onto
    /// each envelope.
    ///
    /// Does nothing (and touches no store) if there is nothing to save.
    /// Otherwise appends the whole batch atomically, then runs every
    /// projection. The uncommitted buffer is cleared only when all of that
    /// succeeded, so a failed save can be retried.
    ///
    /// # Errors
    ///
    /// - [`Error::ConcurrencyConflict`] if the stream moved on since the
    ///   aggregate was loaded. No retry is attempted.
    /// - The first projection error. The append is already durable then.
    /// - [`Error::Cancelled`] if `cancel` fires before the append completes.
    pub async fn save_with_headers<A: Aggregate>(
        &self,
        aggregate: &mut A,
        headers: Option<&EventHeaders>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let uncommitted = aggregate.uncommitted_events();
        if uncommitted.is_empty() {
            return Ok(());
        }

        let stream_id = aggregate_stream_id(A::AGGREGATE_TYPE, aggregate.id())?;
        let expected = expected_version_for_save(aggregate.version(), uncommitted.len());
        let batch = uncommitted
            .iter()
            .map(|event| self.codec.to_envelope(event.as_ref(), headers))
            .collect::<Result<Vec<_>>>()?;

        {
            let _gate = cancellable(cancel, async { Ok(self.save_gate.lock().await) }).await?;

            cancellable(
                cancel,
                self.store
                    .append_to_stream(&stream_id, expected, batch.clone()),
            )
            .await?;

            let outcomes = futures::future::join_all(
                self.projections
                    .iter()
                    .map(|projection| projection.process_events(&stream_id, &batch, cancel)),
            )
            .await;
            if let Some(err) = outcomes.into_iter().find_map(|r| r.err()) {
                tracing::error!(
                    stream_id = %stream_id,
                    error = %err,
                    "projection failed after append"
                );
                return Err(err);
            }
        }

        tracing::debug!(
            stream_id = %stream_id,
            expected = %expected,
            count = batch.len(),
            "saved aggregate"
        );
        aggregate.clear_uncommitted_events();
        Ok(())
    }
}
