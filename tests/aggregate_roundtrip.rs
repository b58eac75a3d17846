//! Integration tests for loading and saving aggregates through the public
//! API: `EventStoreBuilder`, `EventStore::save` and `EventStore::get_by_id`
//! over an `InMemoryStreamStore`.

use std::sync::Arc;

use eventfold_sourcing::{
    Aggregate, BoxedEvent, DynEvent, Error, Event, EventHeaders, EventStore, EventStoreBuilder,
    ExpectedVersion, InMemoryStreamStore, StoreCall, StreamStore,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AccountOpened {
    id: Uuid,
    owner: String,
}

impl Event for AccountOpened {
    const EVENT_TYPE: &'static str = "AccountOpened";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Deposited {
    amount: u64,
}

impl Event for Deposited {
    const EVENT_TYPE: &'static str = "Deposited";
}

/// Minimal bank account: opened once, then credited.
#[derive(Debug, Default)]
struct Account {
    id: Uuid,
    owner: String,
    balance: u64,
    version: u64,
    uncommitted: Vec<BoxedEvent>,
}

impl Account {
    fn open(id: Uuid, owner: &str) -> Self {
        let mut account = Self::default();
        account.record(Box::new(AccountOpened {
            id,
            owner: owner.to_owned(),
        }));
        account
    }

    fn deposit(&mut self, amount: u64) {
        self.record(Box::new(Deposited { amount }));
    }

    fn record(&mut self, event: BoxedEvent) {
        self.apply(event.as_ref());
        self.uncommitted.push(event);
    }

    fn apply(&mut self, event: &dyn DynEvent) {
        if let Some(opened) = event.downcast_ref::<AccountOpened>() {
            self.id = opened.id;
            self.owner = opened.owner.clone();
        } else if let Some(deposit) = event.downcast_ref::<Deposited>() {
            self.balance += deposit.amount;
        }
        self.version += 1;
    }
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "Account";

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
        if !events.first()?.is::<AccountOpened>() {
            return None;
        }
        let mut account = Self::default();
        for event in &events {
            account.apply(event.as_ref());
        }
        Some(account)
    }
}

fn build(memory: &InMemoryStreamStore) -> EventStore {
    EventStoreBuilder::new()
        .store(Arc::new(memory.clone()))
        .event::<AccountOpened>()
        .event::<Deposited>()
        .build()
        .expect("store should build")
}

fn appends(memory: &InMemoryStreamStore) -> Vec<(String, ExpectedVersion, usize)> {
    memory
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            StoreCall::Append {
                stream_id,
                expected,
                count,
            } => Some((stream_id, expected, count)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn create_load_extend_reload() {
    let memory = InMemoryStreamStore::new();
    let store = build(&memory);
    let cancel = CancellationToken::new();
    let id = Uuid::new_v4();

    let mut account = Account::open(id, "ada");
    store.save(&mut account, &cancel).await.expect("first save");
    assert!(account.uncommitted_events().is_empty());

    let mut loaded: Account = store.get_by_id(id, &cancel).await.expect("load");
    assert_eq!(loaded.id(), id);
    assert_eq!(loaded.owner, "ada");
    assert_eq!(loaded.version(), 1);

    loaded.deposit(25);
    store.save(&mut loaded, &cancel).await.expect("second save");

    let stream_id = format!("Account-{id}");
    let page = memory
        .read_stream_forwards(&stream_id, 0, 10)
        .await
        .expect("read aggregate stream");
    assert_eq!(page.messages.len(), 2);
    assert_eq!(page.messages[1].message_type, "Deposited");

    let reloaded: Account = store.get_by_id(id, &cancel).await.expect("reload");
    assert_eq!(reloaded.version(), 2);
    assert_eq!(reloaded.balance, 25);

    assert_eq!(
        appends(&memory),
        vec![
            (stream_id.clone(), ExpectedVersion::NoStream, 1),
            ("@ce-Account".to_owned(), ExpectedVersion::NoStream, 1),
            (stream_id, ExpectedVersion::Exact(0), 1),
            ("@ce-Account".to_owned(), ExpectedVersion::Exact(0), 1),
        ]
    );
}

#[tokio::test]
async fn saving_nothing_touches_nothing() {
    let memory = InMemoryStreamStore::new();
    let store = build(&memory);
    let cancel = CancellationToken::new();
    let id = Uuid::new_v4();

    let mut account = Account::open(id, "grace");
    store.save(&mut account, &cancel).await.expect("save");
    memory.clear_calls();

    store.save(&mut account, &cancel).await.expect("empty save");
    assert!(memory.calls().is_empty());
}

#[tokio::test]
async fn missing_aggregate_is_reported() {
    let store = build(&InMemoryStreamStore::new());
    let err = store
        .get_by_id::<Account>(Uuid::new_v4(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AggregateNotFound { .. }));
}

#[tokio::test]
async fn concurrent_writer_conflicts_and_keeps_events() {
    let memory = InMemoryStreamStore::new();
    let store = build(&memory);
    let cancel = CancellationToken::new();
    let id = Uuid::new_v4();

    let mut account = Account::open(id, "alan");
    store.save(&mut account, &cancel).await.expect("save");

    let mut first: Account = store.get_by_id(id, &cancel).await.expect("load first");
    let mut second: Account = store.get_by_id(id, &cancel).await.expect("load second");
    first.deposit(1);
    second.deposit(2);
    store.save(&mut first, &cancel).await.expect("first writer wins");

    let err = store.save(&mut second, &cancel).await.unwrap_err();
    assert!(err.is_concurrency_conflict());
    assert_eq!(second.uncommitted_events().len(), 1);
}

#[tokio::test]
async fn headers_reach_envelope_metadata() {
    let memory = InMemoryStreamStore::new();
    let store = build(&memory);
    let cancel = CancellationToken::new();
    let id = Uuid::new_v4();

    let mut account = Account::open(id, "barbara");
    let headers = EventHeaders::default()
        .with_actor("teller-7")
        .with_correlation_id("req-42");
    store
        .save_with_headers(&mut account, &headers, &cancel)
        .await
        .expect("save");

    let page = memory
        .read_stream_forwards(&format!("Account-{id}"), 0, 1)
        .await
        .expect("read");
    let message = &page.messages[0];
    let codec = store.codec();
    assert_eq!(
        codec.try_get_metadata(message, "actor"),
        Some(serde_json::json!("teller-7"))
    );
    assert_eq!(
        codec.try_get_metadata(message, "correlation_id"),
        Some(serde_json::json!("req-42"))
    );
    assert!(codec.try_get_metadata(message, "timestamp").is_some());
}
