//! Event-sourcing persistence over an append-only stream store.
//!
//! Aggregates are loaded from and saved to `{Type}-{id}` streams with
//! optimistic concurrency. Saved batches are mirrored into per-type
//! category streams (`@ce-{Type}`), which checkpointed subscriptions
//! follow. A global subscription fans the whole log out to observers.

mod aggregate;
pub use aggregate::Aggregate;
mod checkpoint;
pub use checkpoint::{CHECKPOINT_MESSAGE_TYPE, CheckpointState, CheckpointStore};
mod codec;
pub use codec::{EventCodec, JsonSerializer, Serializer, TIMESTAMP_KEY, VERSION_KEY, is_system_stream};
mod config;
mod error;
mod event;
mod headers;
mod live;
mod memory;
pub mod persistence;
mod projection;
mod replay;
mod store;
mod stream;
pub mod stream_id;
mod subscription;

pub use config::EventSourcingConfig;
pub use error::{Error, Result};
pub use event::{BoxedEvent, DynEvent, Event, EventRegistry};
pub use headers::EventHeaders;
pub use live::{ActivityFlag, EventObserver, FailureReset, GlobalSubscription, LiveConfig, LiveHandle};
pub use memory::{InMemoryStreamStore, StoreCall};
pub use persistence::EventPersistence;
pub use projection::{CategoryProjection, Projection};
pub use replay::{EventHandler, ReceivedEvent, ReplayManager};
pub use store::{EventStore, EventStoreBuilder};
pub use stream::{
    AppendResult, ExpectedVersion, MessageStream, NewStreamMessage, ReadAllPage, ReadStreamPage,
    StreamMessage, StreamMetadata, StreamStore, last_message_of_stream, last_version_of_stream,
};
pub use subscription::{
    PersistentSubscriptionManager, SubscriptionId, SubscriptionState, SubscriptionStatus,
};
