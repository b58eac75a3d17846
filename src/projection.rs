//! Projections notified synchronously when an aggregate is saved.
//!
//! [`EventPersistence`](crate::EventPersistence) hands each successfully
//! appended batch to every registered [`Projection`]. The built-in
//! [`CategoryProjection`] re-appends the batch to the aggregate type's
//! category stream (`@ce-{Type}`), giving consumers one ordered stream per
//! aggregate type.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::stream::{ExpectedVersion, NewStreamMessage, StreamStore, cancellable, last_version_of_stream};
use crate::stream_id::category_of;

/// Derived view updated from each saved batch.
///
/// # Contract
///
/// - Called once per successful append, after the batch is durable in the
///   aggregate stream. A failure makes the save fail but does not undo the
///   append, so implementations must tolerate seeing a batch again.
/// - Calls never overlap for one persistence instance.
#[async_trait::async_trait]
pub trait Projection: Send + Sync {
    /// Apply `events`, just appended to `stream_id`.
    async fn process_events(
        &self,
        stream_id: &str,
        events: &[NewStreamMessage],
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Appends every saved batch to its category stream.
///
/// The expected version of each category stream is cached after the first
/// lookup, so consecutive saves into one category append at sequential
/// versions without reading the stream again. The cache is local to this
/// instance; the store's concurrency check remains the final arbiter and a
/// conflict leaves the cache untouched.
pub struct CategoryProjection {
    store: Arc<dyn StreamStore>,
    expected_versions: DashMap<String, ExpectedVersion>,
}

impl std::fmt::Debug for CategoryProjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategoryProjection")
            .field("cached_categories", &self.expected_versions.len())
            .finish()
    }
}

impl CategoryProjection {
    /// Create a projection writing through `store`.
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self {
            store,
            expected_versions: DashMap::new(),
        }
    }

    /// Forget every cached expected version. The next batch per category
    /// reads the stream's last version again.
    pub fn clear_cache(&self) {
        self.expected_versions.clear();
    }

    /// The cached expected version of `category_stream_id`, if any.
    pub fn cached_version(&self, category_stream_id: &str) -> Option<ExpectedVersion> {
        self.expected_versions
            .get(category_stream_id)
            .map(|entry| *entry.value())
    }
}

#[async_trait::async_trait]
impl Projection for CategoryProjection {
    async fn process_events(
        &self,
        stream_id: &str,
        events: &[NewStreamMessage],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let category = category_of(stream_id)?;

        // Copy out of the map; no shard lock is held across an await.
        let cached = self.cached_version(&category);
        let expected = match cached {
            Some(expected) => expected,
            None => {
                let last = last_version_of_stream(self.store.as_ref(), &category, cancel).await?;
                ExpectedVersion::from_last_version(last)
            }
        };

        cancellable(
            cancel,
            self.store
                .append_to_stream(&category, expected, events.to_vec()),
        )
        .await?;

        self.expected_versions
            .insert(category.clone(), expected.advanced_by(events.len()));
        tracing::debug!(
            category = %category,
            stream_id,
            count = events.len(),
            cache_hit = cached.is_some(),
            "category projection: appended batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::aggregate::test_fixtures::{SecondaryEvent, test_codec};
    use crate::error::Error;
    use crate::memory::{InMemoryStreamStore, StoreCall};
    use crate::stream_id::aggregate_stream_id;

    fn batch(count: usize) -> Vec<NewStreamMessage> {
        let codec = test_codec();
        (0..count)
            .map(|_| codec.to_envelope(&SecondaryEvent, None).expect("encode"))
            .collect()
    }

    fn setup() -> (InMemoryStreamStore, CategoryProjection) {
        let memory = InMemoryStreamStore::new();
        let projection = CategoryProjection::new(Arc::new(memory.clone()));
        (memory, projection)
    }

    #[tokio::test]
    async fn consecutive_batches_hit_the_cache() {
        let (memory, projection) = setup();
        let cancel = CancellationToken::new();
        let first = aggregate_stream_id("Test", Uuid::new_v4()).expect("id");
        let second = aggregate_stream_id("Test", Uuid::new_v4()).expect("id");

        projection
            .process_events(&first, &batch(1), &cancel)
            .await
            .expect("first batch");
        projection
            .process_events(&second, &batch(1), &cancel)
            .await
            .expect("second batch");

        let calls = memory.calls();
        let reverse_reads = calls
            .iter()
            .filter(|c| matches!(c, StoreCall::ReadBackwards { .. }))
            .count();
        assert_eq!(reverse_reads, 1);

        let appends: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                StoreCall::Append {
                    stream_id,
                    expected,
                    ..
                } => Some((stream_id.as_str(), *expected)),
                _ => None,
            })
            .collect();
        assert_eq!(
            appends,
            vec![
                ("@ce-Test", ExpectedVersion::NoStream),
                ("@ce-Test", ExpectedVersion::Exact(0)),
            ]
        );
        assert_eq!(
            projection.cached_version("@ce-Test"),
            Some(ExpectedVersion::Exact(1))
        );
    }

    #[tokio::test]
    async fn cache_miss_reads_existing_category_version() {
        let (memory, projection) = setup();
        let cancel = CancellationToken::new();
        memory
            .append_to_stream("@ce-Test", ExpectedVersion::NoStream, batch(3))
            .await
            .expect("seed category");

        let stream = aggregate_stream_id("Test", Uuid::new_v4()).expect("id");
        projection
            .process_events(&stream, &batch(2), &cancel)
            .await
            .expect("batch");

        assert_eq!(
            projection.cached_version("@ce-Test"),
            Some(ExpectedVersion::Exact(4))
        );
        let page = memory
            .read_stream_forwards("@ce-Test", 0, 10)
            .await
            .expect("read category");
        assert_eq!(page.messages.len(), 5);
    }

    #[tokio::test]
    async fn conflict_propagates_and_leaves_cache_stale() {
        let (memory, projection) = setup();
        let cancel = CancellationToken::new();
        let stream = aggregate_stream_id("Test", Uuid::new_v4()).expect("id");
        projection
            .process_events(&stream, &batch(1), &cancel)
            .await
            .expect("first batch");

        // Another writer moves the category on behind the cache's back.
        memory
            .append_to_stream("@ce-Test", ExpectedVersion::Any, batch(1))
            .await
            .expect("foreign append");

        let err = projection
            .process_events(&stream, &batch(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrencyConflict { .. }));
        assert_eq!(
            projection.cached_version("@ce-Test"),
            Some(ExpectedVersion::Exact(0))
        );

        projection.clear_cache();
        projection
            .process_events(&stream, &batch(1), &cancel)
            .await
            .expect("append after cache clear");
    }

    #[tokio::test]
    async fn separate_instances_do_not_share_cache() {
        let memory = InMemoryStreamStore::new();
        let a = CategoryProjection::new(Arc::new(memory.clone()));
        let b = CategoryProjection::new(Arc::new(memory.clone()));
        let cancel = CancellationToken::new();
        let stream = aggregate_stream_id("Test", Uuid::new_v4()).expect("id");

        a.process_events(&stream, &batch(1), &cancel)
            .await
            .expect("batch via a");
        assert!(b.cached_version("@ce-Test").is_none());
    }

    #[tokio::test]
    async fn empty_batch_is_ignored() {
        let (memory, projection) = setup();
        projection
            .process_events("Test-x", &[], &CancellationToken::new())
            .await
            .expect("empty batch");
        assert!(memory.calls().is_empty());
    }

    #[tokio::test]
    async fn cancelled_append_does_not_touch_cache() {
        let (memory, projection) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = projection
            .process_events("Test-x", &batch(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(projection.cached_version("@ce-Test").is_none());
        assert_eq!(memory.retained_count("@ce-Test").await, 0);
    }
}
