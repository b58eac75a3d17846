//! The append-only stream store this crate orchestrates.
//!
//! [`StreamStore`] is the narrow contract consumed from the storage layer:
//! paged reads in both directions, reads over the global log, optimistic
//! appends, catch-up subscriptions, deletion and stream metadata. Everything
//! above it (persistence, projections, replay, subscriptions) speaks only in
//! these Rust-native types so backends stay swappable.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Expected stream state for optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream's last version must be exactly this value.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expected version for appending after a stream whose last version is
    /// `last` (`None` meaning the stream does not exist).
    pub fn from_last_version(last: Option<u64>) -> Self {
        match last {
            Some(v) => Self::Exact(v),
            None => Self::NoStream,
        }
    }

    /// The expected version a writer should use after successfully
    /// appending `count` messages at `self`.
    ///
    /// `Any` stays `Any`; appending nothing leaves the value unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventfold_sourcing::ExpectedVersion;
    ///
    /// assert_eq!(ExpectedVersion::NoStream.advanced_by(3), ExpectedVersion::Exact(2));
    /// assert_eq!(ExpectedVersion::Exact(4).advanced_by(1), ExpectedVersion::Exact(5));
    /// ```
    pub fn advanced_by(self, count: usize) -> Self {
        if count == 0 {
            return self;
        }
        let count = count as u64;
        match self {
            Self::Any => Self::Any,
            Self::NoStream => Self::Exact(count - 1),
            Self::Exact(v) => Self::Exact(v + count),
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::NoStream => f.write_str("no stream"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// A message proposed for appending, not yet assigned a version.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStreamMessage {
    /// Unique message id, generated by the encoder.
    pub message_id: Uuid,
    /// Registered event type name.
    pub message_type: String,
    /// Serialized payload.
    pub json_data: String,
    /// Serialized metadata map.
    pub json_metadata: String,
}

/// A message as recorded by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Stream the message belongs to.
    pub stream_id: String,
    /// Unique message id.
    pub message_id: Uuid,
    /// Registered event type name.
    pub message_type: String,
    /// Zero-based version within `stream_id`.
    pub stream_version: u64,
    /// Zero-based position in the global log.
    pub position: u64,
    /// When the store recorded the message.
    pub created_utc: DateTime<Utc>,
    /// Serialized payload.
    pub json_data: String,
    /// Serialized metadata map.
    pub json_metadata: String,
}

/// One page of a single-stream read.
#[derive(Debug, Clone)]
pub struct ReadStreamPage {
    /// Stream that was read.
    pub stream_id: String,
    /// Version the read started from.
    pub from_version: u64,
    /// Version to pass to the next read in the same direction.
    pub next_version: u64,
    /// Last version of the stream at read time; `None` if it does not exist.
    pub last_stream_version: Option<u64>,
    /// `true` once the read reached the end in its direction.
    pub is_end: bool,
    /// Messages in read order.
    pub messages: Vec<StreamMessage>,
}

/// One page of a read over the global log.
#[derive(Debug, Clone)]
pub struct ReadAllPage {
    /// Position the read started from.
    pub from_position: u64,
    /// Position to pass to the next forward read.
    pub next_position: u64,
    /// `true` once the head of the log was reached.
    pub is_end: bool,
    /// Messages in log order.
    pub messages: Vec<StreamMessage>,
}

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Last version of the stream after the append.
    pub current_version: u64,
    /// Global position of the last appended message.
    pub current_position: u64,
}

/// Metadata the store keeps per stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    /// Stream the metadata belongs to.
    pub stream_id: String,
    /// Maximum number of messages retained; older ones are truncated.
    pub max_count: Option<u64>,
    /// Version of the metadata record itself; `None` if never set.
    pub metadata_version: Option<u64>,
}

/// Messages delivered by a subscription.
///
/// The stream yields messages in store order. An `Err` item or the end of
/// the stream means the subscription dropped; the consumer decides whether
/// to resubscribe.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<StreamMessage>> + Send>>;

/// The append-only stream store collaborator.
///
/// Implementations must enforce [`ExpectedVersion`] on appends and
/// deliver subscription messages in append order.
#[async_trait::async_trait]
pub trait StreamStore: Send + Sync {
    /// Read up to `max_count` messages of `stream_id` starting at
    /// `from_version`. A missing stream yields an empty page whose
    /// `last_stream_version` is `None`.
    async fn read_stream_forwards(
        &self,
        stream_id: &str,
        from_version: u64,
        max_count: usize,
    ) -> Result<ReadStreamPage>;

    /// Read up to `max_count` messages of `stream_id` backwards starting at
    /// `from_version`, or at the end of the stream when `None`.
    async fn read_stream_backwards(
        &self,
        stream_id: &str,
        from_version: Option<u64>,
        max_count: usize,
    ) -> Result<ReadStreamPage>;

    /// Read up to `max_count` messages of the global log starting at
    /// `from_position`.
    async fn read_all_forwards(&self, from_position: u64, max_count: usize)
    -> Result<ReadAllPage>;

    /// Append `messages` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyConflict`] if the stream does not match
    /// `expected`.
    async fn append_to_stream(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
    ) -> Result<AppendResult>;

    /// Subscribe to `stream_id`, receiving every message after
    /// `after_version` (from the start when `None`), then live messages.
    async fn subscribe_to_stream(
        &self,
        stream_id: &str,
        after_version: Option<u64>,
        name: &str,
    ) -> Result<MessageStream>;

    /// Subscribe to the global log, receiving every message after
    /// `after_position` (from the start when `None`), then live messages.
    async fn subscribe_to_all(&self, after_position: Option<u64>) -> Result<MessageStream>;

    /// Delete `stream_id` and all its messages. Deleting a missing stream
    /// with [`ExpectedVersion::Any`] succeeds.
    async fn delete_stream(&self, stream_id: &str, expected: ExpectedVersion) -> Result<()>;

    /// Fetch the metadata of `stream_id`.
    async fn get_stream_metadata(&self, stream_id: &str) -> Result<StreamMetadata>;

    /// Replace the metadata of `stream_id`. `expected` is checked against
    /// the metadata record's own version.
    async fn set_stream_metadata(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        max_count: Option<u64>,
    ) -> Result<()>;
}

/// Run `fut` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] if the token is (or becomes) cancelled
/// before `fut` completes; the future is dropped in that case.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Read the newest message of `stream_id` with a single reverse read of one.
///
/// # Returns
///
/// The stream's last version (`None` if it does not exist) and the newest
/// retained message, if any.
pub async fn last_message_of_stream(
    store: &dyn StreamStore,
    stream_id: &str,
    cancel: &CancellationToken,
) -> Result<(Option<u64>, Option<StreamMessage>)> {
    let page = cancellable(cancel, store.read_stream_backwards(stream_id, None, 1)).await?;
    Ok((page.last_stream_version, page.messages.into_iter().next()))
}

/// Last version of `stream_id`, or `None` if the stream does not exist.
pub async fn last_version_of_stream(
    store: &dyn StreamStore,
    stream_id: &str,
    cancel: &CancellationToken,
) -> Result<Option<u64>> {
    let page = cancellable(cancel, store.read_stream_backwards(stream_id, None, 1)).await?;
    Ok(page.last_stream_version)
}
