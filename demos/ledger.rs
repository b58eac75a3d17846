//! Self-contained demo of aggregates, the category subscription and the
//! global subscription, all running against the in-memory stream store.
//!
//! Run with: `cargo run --example ledger`

use std::sync::{Arc, Mutex};

use eventfold_sourcing::{
    ActivityFlag, Aggregate, BoxedEvent, DynEvent, Event, EventObserver, EventStoreBuilder,
    InMemoryStreamStore, ReceivedEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Ledger aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerOpened {
    id: Uuid,
    name: String,
}

impl Event for LedgerOpened {
    const EVENT_TYPE: &'static str = "LedgerOpened";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryPosted {
    amount: i64,
}

impl Event for EntryPosted {
    const EVENT_TYPE: &'static str = "EntryPosted";
}

/// A named ledger whose balance is the sum of its posted entries.
#[derive(Debug, Default)]
struct Ledger {
    id: Uuid,
    name: String,
    balance: i64,
    version: u64,
    uncommitted: Vec<BoxedEvent>,
}

impl Ledger {
    fn open(name: &str) -> Self {
        let mut ledger = Self::default();
        ledger.record(Box::new(LedgerOpened {
            id: Uuid::new_v4(),
            name: name.to_owned(),
        }));
        ledger
    }

    fn post(&mut self, amount: i64) {
        self.record(Box::new(EntryPosted { amount }));
    }

    fn record(&mut self, event: BoxedEvent) {
        self.apply(event.as_ref());
        self.uncommitted.push(event);
    }

    fn apply(&mut self, event: &dyn DynEvent) {
        if let Some(opened) = event.downcast_ref::<LedgerOpened>() {
            self.id = opened.id;
            self.name = opened.name.clone();
        } else if let Some(entry) = event.downcast_ref::<EntryPosted>() {
            self.balance += entry.amount;
        }
        self.version += 1;
    }
}

impl Aggregate for Ledger {
    const AGGREGATE_TYPE: &'static str = "Ledger";

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
        if !events.first()?.is::<LedgerOpened>() {
            return None;
        }
        let mut ledger = Self::default();
        for event in &events {
            ledger.apply(event.as_ref());
        }
        Some(ledger)
    }
}

// ---------------------------------------------------------------------------
// Global observer
// ---------------------------------------------------------------------------

/// Keeps a running total of every posted entry in the store.
struct Totals {
    flag: ActivityFlag,
    total: Mutex<i64>,
}

#[async_trait::async_trait]
impl EventObserver for Totals {
    async fn event_received(
        &self,
        received: ReceivedEvent,
        _cancel: &CancellationToken,
    ) -> eventfold_sourcing::Result<()> {
        if let Some(entry) = received.event.downcast_ref::<EntryPosted>()
            && let Ok(mut total) = self.total.lock()
        {
            *total += entry.amount;
        }
        Ok(())
    }

    fn activity(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let totals = Arc::new(Totals {
        flag: ActivityFlag::new(true),
        total: Mutex::new(0),
    });
    let store = EventStoreBuilder::new()
        .store(Arc::new(InMemoryStreamStore::new()))
        .event::<LedgerOpened>()
        .event::<EntryPosted>()
        .observer(Arc::clone(&totals) as Arc<dyn EventObserver>)
        .build()?;
    let cancel = CancellationToken::new();

    let mut cash = Ledger::open("cash");
    cash.post(100);
    cash.post(-30);
    store.save(&mut cash, &cancel).await?;

    let mut bank = Ledger::open("bank");
    bank.post(500);
    store.save(&mut bank, &cancel).await?;

    let posted = Arc::new(Mutex::new(0_usize));
    let counter = Arc::clone(&posted);
    let subscription = store
        .create_category_subscription(
            "Ledger",
            move |received: ReceivedEvent| {
                if received.event.is::<EntryPosted>()
                    && let Ok(mut count) = counter.lock()
                {
                    *count += 1;
                }
                futures::future::ready(Ok::<_, eventfold_sourcing::Error>(()))
            },
            &cancel,
        )
        .await?;
    println!(
        "category checkpoint after catch-up: {:?}",
        store.load_checkpoint("Ledger", &cancel).await?
    );

    store.start_live().await?;
    cash.post(7);
    store.save(&mut cash, &cancel).await?;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let reloaded: Ledger = store.get_by_id(cash.id(), &cancel).await?;
    println!("{} balance = {}", reloaded.name, reloaded.balance);
    println!("entries seen by category subscription = {}", *posted.lock().map_err(|e| e.to_string())?);
    println!("total seen by global observer = {}", *totals.total.lock().map_err(|e| e.to_string())?);
    println!("global checkpoint = {:?}", store.global_checkpoint());
    assert_eq!(reloaded.balance, 77);

    store.close_subscription(&subscription, &cancel).await?;
    store.shutdown().await?;
    Ok(())
}
