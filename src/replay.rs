//! Catch-up reads from a checkpoint to the head of a stream or the log.
//!
//! Both entry points page forward in store order and hand every decoded
//! event to an [`EventHandler`], awaiting each call before issuing the next.
//! Checkpoints are "last processed" markers: a replay resumes right after
//! the checkpoint and returns the checkpoint to persist next.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::codec::{EventCodec, is_system_stream};
use crate::config::EventSourcingConfig;
use crate::error::Result;
use crate::event::DynEvent;
use crate::stream::{StreamMessage, StreamStore, cancellable, last_version_of_stream};

/// An event delivered to a handler, with its place in the store.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    /// The decoded event.
    pub event: Arc<dyn DynEvent>,
    /// Stream the event was read from.
    pub stream_id: String,
    /// Position in the global log.
    pub position: u64,
    /// Version within `stream_id`.
    pub stream_version: u64,
}

impl ReceivedEvent {
    pub(crate) fn decode(codec: &EventCodec, message: &StreamMessage) -> Result<Self> {
        Ok(Self {
            event: Arc::from(codec.from_envelope(message)?),
            stream_id: message.stream_id.clone(),
            position: message.position,
            stream_version: message.stream_version,
        })
    }
}

/// Receives replayed or live events one at a time.
///
/// Implemented for any `Fn(ReceivedEvent) -> impl Future<Output = Result<()>>`,
/// so closures can be passed directly.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event. An error stops the replay (or drops the
    /// subscription) that delivered it.
    async fn handle(&self, received: ReceivedEvent) -> Result<()>;
}

#[async_trait::async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(ReceivedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, received: ReceivedEvent) -> Result<()> {
        (self)(received).await
    }
}

/// Pages through history and feeds it to handlers.
#[derive(Clone)]
pub struct ReplayManager {
    store: Arc<dyn StreamStore>,
    codec: EventCodec,
    config: EventSourcingConfig,
}

impl std::fmt::Debug for ReplayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayManager")
            .field("config", &self.config)
            .finish()
    }
}

impl ReplayManager {
    /// Create a replay manager reading through `store`.
    pub fn new(store: Arc<dyn StreamStore>, codec: EventCodec, config: EventSourcingConfig) -> Self {
        Self {
            store,
            codec,
            config,
        }
    }

    /// Replay the global log after `checkpoint` (from the start when
    /// `None`), skipping infrastructure streams.
    ///
    /// # Returns
    ///
    /// The position of the last message read, suitable as the next
    /// checkpoint. Unchanged if nothing new was read.
    ///
    /// # Errors
    ///
    /// Decode and handler errors stop the replay and propagate; so does
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    pub async fn replay_from_global(
        &self,
        checkpoint: Option<u64>,
        handler: &dyn EventHandler,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>> {
        let started = Instant::now();
        let mut from_position = checkpoint.map_or(0, |c| c + 1);
        let mut delivered = 0usize;

        let next_position = loop {
            let page = cancellable(
                cancel,
                self.store
                    .read_all_forwards(from_position, self.config.max_read_stream_forward),
            )
            .await?;
            if page.messages.is_empty() {
                break page.next_position;
            }
            for message in &page.messages {
                if is_system_stream(message) {
                    tracing::debug!(
                        stream_id = %message.stream_id,
                        position = message.position,
                        "replay: skipping system stream message"
                    );
                    continue;
                }
                let received = ReceivedEvent::decode(&self.codec, message)?;
                cancellable(cancel, handler.handle(received)).await?;
                delivered += 1;
            }
            from_position = page.next_position;
        };

        let last_position = next_position.checked_sub(1).or(checkpoint);
        tracing::info!(
            ?checkpoint,
            ?last_position,
            delivered,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "replay from global log finished"
        );
        Ok(last_position)
    }

    /// Replay `stream_id` after `checkpoint` (from the start when `None`).
    ///
    /// If the stream is at most `subscription_checkpoint_delta` versions
    /// past the checkpoint, nothing is read and `checkpoint` is returned
    /// as is; a live subscription started from it covers the gap.
    ///
    /// # Returns
    ///
    /// The stream's last version as reported by the final page read, or
    /// `checkpoint` when the replay was skipped.
    ///
    /// # Errors
    ///
    /// Decode and handler errors stop the replay and propagate; so does
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    pub async fn replay_from_stream(
        &self,
        stream_id: &str,
        checkpoint: Option<u64>,
        handler: &dyn EventHandler,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>> {
        let started = Instant::now();
        let last_version = last_version_of_stream(self.store.as_ref(), stream_id, cancel).await?;
        let behind = version_ordinal(last_version) - version_ordinal(checkpoint);
        if behind <= self.config.subscription_checkpoint_delta as i128 {
            tracing::debug!(
                stream_id,
                ?checkpoint,
                ?last_version,
                "replay: stream within checkpoint delta, skipping"
            );
            return Ok(checkpoint);
        }

        let mut from_version = checkpoint.map_or(0, |c| c + 1);
        let mut delivered = 0usize;
        let last_stream_version = loop {
            let page = cancellable(
                cancel,
                self.store.read_stream_forwards(
                    stream_id,
                    from_version,
                    self.config.max_read_stream_forward,
                ),
            )
            .await?;
            if page.messages.is_empty() {
                break page.last_stream_version;
            }
            for message in &page.messages {
                let received = ReceivedEvent::decode(&self.codec, message)?;
                cancellable(cancel, handler.handle(received)).await?;
                delivered += 1;
            }
            from_version = page.next_version;
        };

        tracing::info!(
            stream_id,
            ?checkpoint,
            ?last_stream_version,
            delivered,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "replay from stream finished"
        );
        Ok(last_stream_version.or(checkpoint))
    }
}

/// Orders `None` ("nothing yet") before version zero.
fn version_ordinal(version: Option<u64>) -> i128 {
    version.map_or(-1, i128::from)
}
