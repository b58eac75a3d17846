//! The aggregate capability consumed by [`EventPersistence`](crate::EventPersistence).
//!
//! Business rules stay in the domain model. This layer only needs an
//! aggregate to report its identity and version, hand over the events it
//! produced since the last save, and be rebuilt from an ordered history.

use uuid::Uuid;

use crate::event::BoxedEvent;

/// An event-sourced aggregate root.
///
/// # Contract
///
/// - [`version`](Aggregate::version) counts every event ever applied,
///   including the ones still uncommitted.
/// - [`uncommitted_events`](Aggregate::uncommitted_events) returns the
///   events produced since the last successful save, oldest first.
/// - [`from_events`](Aggregate::from_events) must apply the history in the
///   order given and leave the uncommitted buffer empty.
pub trait Aggregate: Sized + Send + Sync + 'static {
    /// Type name used as the stream prefix: `{AGGREGATE_TYPE}-{id}`.
    const AGGREGATE_TYPE: &'static str;

    /// Identity of this instance.
    fn id(&self) -> Uuid;

    /// Number of events applied so far.
    fn version(&self) -> u64;

    /// Events produced since the last save.
    fn uncommitted_events(&self) -> &[BoxedEvent];

    /// Forget the uncommitted events after they were persisted.
    fn clear_uncommitted_events(&mut self);

    /// Rebuild an instance from its history.
    ///
    /// Returns `None` if the history does not describe an aggregate of this
    /// type (for example because it is empty).
    fn from_events(events: Vec<BoxedEvent>) -> Option<Self>;
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use super::Aggregate;
    use crate::codec::EventCodec;
    use crate::event::{BoxedEvent, DynEvent, Event, EventRegistry};

    /// Emitted when a [`TestAggregate`] is created.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct TestEvent {
        pub(crate) id: Uuid,
    }

    impl Event for TestEvent {
        const EVENT_TYPE: &'static str = "TestEvent";
    }

    /// Any follow-up change to a [`TestAggregate`].
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct SecondaryEvent;

    impl Event for SecondaryEvent {
        const EVENT_TYPE: &'static str = "SecondaryEvent";
    }

    /// Minimal aggregate: created with a [`TestEvent`], bumped with
    /// [`SecondaryEvent`]s.
    #[derive(Debug, Default)]
    pub(crate) struct TestAggregate {
        pub(crate) id: Uuid,
        pub(crate) version: u64,
        pub(crate) secondary_count: u32,
        pub(crate) uncommitted: Vec<BoxedEvent>,
    }

    impl TestAggregate {
        pub(crate) fn create(id: Uuid) -> Self {
            let mut aggregate = Self::default();
            aggregate.publish(Box::new(TestEvent { id }));
            aggregate
        }

        pub(crate) fn secondary_event(&mut self) {
            self.publish(Box::new(SecondaryEvent));
        }

        fn publish(&mut self, event: BoxedEvent) {
            self.apply(event.as_ref());
            self.uncommitted.push(event);
        }

        fn apply(&mut self, event: &dyn DynEvent) {
            if let Some(created) = event.downcast_ref::<TestEvent>() {
                self.id = created.id;
            } else if event.is::<SecondaryEvent>() {
                self.secondary_count += 1;
            }
            self.version += 1;
        }
    }

    impl Aggregate for TestAggregate {
        const AGGREGATE_TYPE: &'static str = "Test";

        fn id(&self) -> Uuid {
            self.id
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn uncommitted_events(&self) -> &[BoxedEvent] {
            &self.uncommitted
        }

        fn clear_uncommitted_events(&mut self) {
            self.uncommitted.clear();
        }

        fn from_events(events: Vec<BoxedEvent>) -> Option<Self> {
            if !events.first()?.is::<TestEvent>() {
                return None;
            }
            let mut aggregate = Self::default();
            for event in &events {
                aggregate.apply(event.as_ref());
            }
            Some(aggregate)
        }
    }

    pub(crate) fn test_registry() -> EventRegistry {
        let mut registry = EventRegistry::new();
        registry
            .register::<TestEvent>()
            .expect("TestEvent registers");
        registry
            .register::<SecondaryEvent>()
            .expect("SecondaryEvent registers");
        registry
    }

    pub(crate) fn test_codec() -> EventCodec {
        EventCodec::new(test_registry())
    }

    /// Counts how often it was invoked; handy as an event callback.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct CallCounter(Arc<AtomicUsize>);

    impl CallCounter {
        pub(crate) fn bump(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        pub(crate) fn get(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;

    #[test]
    fn create_records_one_uncommitted_event() {
        let id = Uuid::new_v4();
        let aggregate = TestAggregate::create(id);
        assert_eq!(aggregate.id(), id);
        assert_eq!(aggregate.version(), 1);
        assert_eq!(aggregate.uncommitted_events().len(), 1);
    }

    #[test]
    fn from_events_replays_in_order() {
        let id = Uuid::new_v4();
        let history: Vec<BoxedEvent> = vec![
            Box::new(TestEvent { id }),
            Box::new(SecondaryEvent),
            Box::new(SecondaryEvent),
        ];
        let aggregate = TestAggregate::from_events(history).expect("valid history");
        assert_eq!(aggregate.id(), id);
        assert_eq!(aggregate.version(), 3);
        assert_eq!(aggregate.secondary_count, 2);
        assert!(aggregate.uncommitted_events().is_empty());
    }

    #[test]
    fn from_events_rejects_empty_history() {
        assert!(TestAggregate::from_events(Vec::new()).is_none());
    }

    #[test]
    fn clear_uncommitted_keeps_version() {
        let mut aggregate = TestAggregate::create(Uuid::new_v4());
        aggregate.secondary_event();
        aggregate.clear_uncommitted_events();
        assert!(aggregate.uncommitted_events().is_empty());
        assert_eq!(aggregate.version(), 2);
    }
}
