//! Integration tests for catch-up, category subscriptions, checkpoints and
//! the global subscription, driven through `EventStore`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventfold_sourcing::{
    ActivityFlag, Aggregate, BoxedEvent, Error, Event, EventObserver, EventStore, EventStoreBuilder,
    InMemoryStreamStore, ReceivedEvent, Result, StoreCall, SubscriptionState,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TicketOpened {
    id: Uuid,
}

impl Event for TicketOpened {
    const EVENT_TYPE: &'static str = "TicketOpened";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TicketClosed;

impl Event for TicketClosed {
    const EVENT_TYPE: &'static str = "TicketClosed";
}

#[derive(Debug, Default)]
struct Ticket {
    id: Uuid,
    version: u64,
    uncommitted: Vec<BoxedEvent>,
}

impl Ticket {
    fn open() -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            version: 1,
            uncommitted: vec![Box::new(TicketOpened { id })],
        }
    }

    fn close(&mut self) {
        self.version += 1;
        self.uncommitted.push(Box::new(TicketClosed));
    }
}

impl Aggregate for Ticket {
    const AGGREGATE_TYPE: &'static str = "Ticket";

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
        let opened = events.first()?.downcast_ref::<TicketOpened>()?;
        Some(Self {
            id: opened.id,
            version: events.len() as u64,
            uncommitted: Vec::new(),
        })
    }
}

fn build(memory: &InMemoryStreamStore) -> EventStore {
    EventStoreBuilder::new()
        .store(Arc::new(memory.clone()))
        .event::<TicketOpened>()
        .event::<TicketClosed>()
        .build()
        .expect("store should build")
}

async fn open_tickets(store: &EventStore, count: usize) {
    let cancel = CancellationToken::new();
    for _ in 0..count {
        let mut ticket = Ticket::open();
        store.save(&mut ticket, &cancel).await.expect("save ticket");
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Collects the stream versions handed to it.
#[derive(Clone, Default)]
struct Collected(Arc<Mutex<Vec<u64>>>);

impl Collected {
    fn handler(&self) -> impl Fn(ReceivedEvent) -> futures::future::Ready<Result<()>> + Send + Sync + 'static {
        let sink = Arc::clone(&self.0);
        move |received: ReceivedEvent| {
            sink.lock().expect("lock").push(received.stream_version);
            futures::future::ready(Ok(()))
        }
    }

    fn len(&self) -> usize {
        self.0.lock().expect("lock").len()
    }
}

#[tokio::test]
async fn category_subscription_catches_up_from_the_start() {
    let memory = InMemoryStreamStore::new();
    let store = build(&memory);
    open_tickets(&store, 101).await;
    memory.clear_calls();

    let collected = Collected::default();
    let cancel = CancellationToken::new();
    let id = store
        .create_category_subscription("Ticket", collected.handler(), &cancel)
        .await
        .expect("create subscription");

    let first_forward_read = memory.calls().into_iter().find_map(|call| match call {
        StoreCall::ReadForwards {
            stream_id,
            from_version,
        } => Some((stream_id, from_version)),
        _ => None,
    });
    assert_eq!(first_forward_read, Some(("@ce-Ticket".to_owned(), 0)));
    assert_eq!(collected.len(), 101);
    assert_eq!(
        store.load_checkpoint("Ticket", &cancel).await.expect("load"),
        Some(100)
    );

    open_tickets(&store, 1).await;
    eventually(|| {
        store
            .subscription_status(&id)
            .is_some_and(|s| s.last_version == Some(101))
    })
    .await;
    assert_eq!(collected.len(), 102);

    store.close_subscription(&id, &cancel).await.expect("close");
    assert_eq!(
        store.load_checkpoint("Ticket", &cancel).await.expect("load"),
        None
    );
}

#[tokio::test]
async fn failed_catch_up_deletes_fresh_checkpoint_stream() {
    let memory = InMemoryStreamStore::new();
    let store = build(&memory);
    let cancel = CancellationToken::new();
    for _ in 0..60 {
        let mut ticket = Ticket::open();
        ticket.close();
        store.save(&mut ticket, &cancel).await.expect("save ticket");
    }

    // A second process that only knows how tickets are opened.
    let partial = EventStoreBuilder::new()
        .store(Arc::new(memory.clone()))
        .event::<TicketOpened>()
        .build()
        .expect("partial store should build");
    memory.clear_calls();

    let err = partial
        .create_category_subscription("Ticket", Collected::default().handler(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownEventType { .. }));
    assert!(memory.calls().contains(&StoreCall::Delete {
        stream_id: "@ce-checkpoint-Ticket".to_owned(),
    }));
    assert_eq!(
        partial.load_checkpoint("Ticket", &cancel).await.expect("load"),
        None
    );
}

#[tokio::test]
async fn subscription_survives_a_dropped_connection() {
    let memory = InMemoryStreamStore::new();
    let store = build(&memory);
    let collected = Collected::default();
    let id = store
        .create_category_subscription("Ticket", collected.handler(), &CancellationToken::new())
        .await
        .expect("create subscription");

    open_tickets(&store, 2).await;
    eventually(|| collected.len() == 2).await;

    memory.drop_subscriptions();
    eventually(|| {
        store
            .subscription_status(&id)
            .is_some_and(|s| s.failures == 1 && s.state == SubscriptionState::Live)
    })
    .await;

    open_tickets(&store, 1).await;
    eventually(|| collected.len() == 3).await;
    store.shutdown().await.expect("shutdown");
    assert!(store.subscription_status(&id).is_none());
}

#[tokio::test]
async fn global_checkpoint_set_and_clear() {
    let store = build(&InMemoryStreamStore::new());
    let cancel = CancellationToken::new();

    store
        .save_global_checkpoint(Some(100), &cancel)
        .await
        .expect("save");
    assert_eq!(store.global_checkpoint(), Some(100));

    store
        .save_global_checkpoint(None, &cancel)
        .await
        .expect("clear");
    assert_eq!(store.global_checkpoint(), None);
    assert_eq!(
        store.load_global_checkpoint(&cancel).await.expect("load"),
        None
    );
}

#[tokio::test]
async fn global_replay_skips_category_streams() {
    let memory = InMemoryStreamStore::new();
    let store = build(&memory);
    open_tickets(&store, 3).await;

    let streams = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&streams);
    let handler = move |received: ReceivedEvent| {
        sink.lock().expect("lock").push(received.stream_id.clone());
        futures::future::ready(Ok::<_, Error>(()))
    };
    let last = store
        .replay_from_global(None, &handler, &CancellationToken::new())
        .await
        .expect("replay");

    // Each save wrote one aggregate event and its category copy.
    assert_eq!(last, Some(5));
    let streams = streams.lock().expect("lock").clone();
    assert_eq!(streams.len(), 3);
    assert!(streams.iter().all(|s| s.starts_with("Ticket-")));
}

/// Counts observed tickets once switched on.
struct Dashboard {
    flag: ActivityFlag,
    seen: Mutex<Vec<Uuid>>,
}

#[async_trait::async_trait]
impl EventObserver for Dashboard {
    async fn event_received(&self, received: ReceivedEvent, _cancel: &CancellationToken) -> Result<()> {
        if let Some(opened) = received.event.downcast_ref::<TicketOpened>() {
            self.seen.lock().expect("lock").push(opened.id);
        }
        Ok(())
    }

    fn activity(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }
}

#[tokio::test]
async fn live_observers_receive_events_once_ready() {
    let memory = InMemoryStreamStore::new();
    let dashboard = Arc::new(Dashboard {
        flag: ActivityFlag::new(false),
        seen: Mutex::new(Vec::new()),
    });
    let store = EventStoreBuilder::new()
        .store(Arc::new(memory.clone()))
        .event::<TicketOpened>()
        .event::<TicketClosed>()
        .observer(Arc::clone(&dashboard) as Arc<dyn EventObserver>)
        .build()
        .expect("store should build");

    open_tickets(&store, 2).await;
    let handle = store.start_live().await.expect("start live");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_live());
    assert!(dashboard.seen.lock().expect("lock").is_empty());

    dashboard.flag.set_active(true);
    eventually(|| dashboard.seen.lock().expect("lock").len() == 2).await;
    eventually(|| store.global_checkpoint() == Some(2)).await;

    store.shutdown().await.expect("shutdown");
}
