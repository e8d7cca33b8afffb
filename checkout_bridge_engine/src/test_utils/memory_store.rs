use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::{
    db_types::{CreditTransaction, Order, OrderFilter, OrderStatusType, RecordEvent, RecordFields},
    traits::{RecordStore, RecordStoreError, StopSignal, Subscription},
};

/// A write that reached the store, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRecord {
    Update { collection: String, id: String, fields: RecordFields },
    Create { collection: String, id: String, fields: RecordFields },
}

impl WriteRecord {
    pub fn fields(&self) -> &RecordFields {
        match self {
            WriteRecord::Update { fields, .. } | WriteRecord::Create { fields, .. } => fields,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WriteRecord::Update { id, .. } | WriteRecord::Create { id, .. } => id,
        }
    }
}

struct Feed {
    events: mpsc::Sender<RecordEvent<Order>>,
    errors: mpsc::Sender<RecordStoreError>,
    kill: Option<oneshot::Sender<RecordStoreError>>,
    stop: StopSignal,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, Value>>,
    writes: Vec<WriteRecord>,
    failed_writes: Vec<WriteRecord>,
    fail_updates_with_status: Option<OrderStatusType>,
    fail_all_updates: bool,
    fail_creates: bool,
    fail_subscriptions: usize,
    subscriptions: usize,
    feeds: HashMap<String, Vec<Feed>>,
    next_id: u64,
    closed: bool,
}

/// A [`RecordStore`] that keeps everything in memory and remembers every write it was asked to make.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_order(&self, collection: &str, order: &Order) {
        if let Ok(value) = serde_json::to_value(order) {
            self.lock().collections.entry(collection.to_string()).or_default().insert(order.id.to_string(), value);
        }
    }

    pub fn order(&self, collection: &str, id: &str) -> Option<Order> {
        let state = self.lock();
        let value = state.collections.get(collection)?.get(id)?.clone();
        serde_json::from_value(value).ok()
    }

    pub fn records(&self, collection: &str) -> Vec<Value> {
        self.lock().collections.get(collection).map(|c| c.values().cloned().collect()).unwrap_or_default()
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn failed_writes(&self) -> Vec<WriteRecord> {
        self.lock().failed_writes.clone()
    }

    /// The fields of every successful update to the given record, in order.
    pub fn updates_for(&self, id: &str) -> Vec<RecordFields> {
        self.lock()
            .writes
            .iter()
            .filter(|w| matches!(w, WriteRecord::Update { .. }) && w.id() == id)
            .map(|w| w.fields().clone())
            .collect()
    }

    pub fn created_in(&self, collection: &str) -> Vec<RecordFields> {
        self.lock()
            .writes
            .iter()
            .filter_map(|w| match w {
                WriteRecord::Create { collection: c, fields, .. } if c == collection => Some(fields.clone()),
                _ => None,
            })
            .collect()
    }

    /// Updates that would set `status` to the given value are refused.
    pub fn fail_updates_with_status(&self, status: OrderStatusType) {
        self.lock().fail_updates_with_status = Some(status);
    }

    pub fn fail_all_updates(&self, fail: bool) {
        self.lock().fail_all_updates = fail;
    }

    pub fn fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    /// The next `n` calls to `subscribe` fail.
    pub fn fail_next_subscriptions(&self, n: usize) {
        self.lock().fail_subscriptions = n;
    }

    /// Total number of `subscribe` calls, including failed ones.
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Delivers a change event to every live subscriber of the collection. Returns the number of subscribers reached.
    pub async fn push_event(&self, collection: &str, event: RecordEvent<Order>) -> usize {
        let senders = {
            let mut state = self.lock();
            let feeds = state.feeds.entry(collection.to_string()).or_default();
            feeds.retain(|f| !f.stop.is_stopped() && !f.events.is_closed());
            feeds.iter().map(|f| f.events.clone()).collect::<Vec<_>>()
        };
        let mut delivered = 0;
        for sender in senders {
            if sender.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Simulates a transport failure on every live subscription to the collection.
    pub fn break_feeds(&self, collection: &str) {
        let mut state = self.lock();
        if let Some(feeds) = state.feeds.get_mut(collection) {
            for feed in feeds.iter_mut() {
                let _ = feed.errors.try_send(RecordStoreError::Transport("connection reset".into()));
                if let Some(kill) = feed.kill.take() {
                    let _ = kill.send(RecordStoreError::SubscriptionClosed("connection reset".into()));
                }
            }
            feeds.clear();
        }
    }

    fn check_update(state: &StoreState, fields: &RecordFields) -> Result<(), RecordStoreError> {
        if state.fail_all_updates {
            return Err(RecordStoreError::Rejected { status: 500, message: "update refused".into() });
        }
        if let Some(status) = state.fail_updates_with_status {
            if fields.get("status").and_then(Value::as_str) == Some(status.as_str()) {
                return Err(RecordStoreError::Rejected { status: 400, message: format!("{status} update refused") });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn subscribe(&self, collection: &str) -> Result<Subscription<Order>, RecordStoreError> {
        let mut state = self.lock();
        state.subscriptions += 1;
        if state.closed {
            return Err(RecordStoreError::Closed);
        }
        if state.fail_subscriptions > 0 {
            state.fail_subscriptions -= 1;
            return Err(RecordStoreError::Transport("subscription refused".into()));
        }
        let (events_tx, events_rx) = mpsc::channel(64);
        let (errors_tx, errors_rx) = mpsc::channel(4);
        let (kill_tx, kill_rx) = oneshot::channel();
        let stop = StopSignal::new();
        let mut stopped = stop.listener();
        let listener = async move {
            tokio::select! {
                _ = stopped.stopped() => Ok(()),
                killed = kill_rx => match killed {
                    Ok(e) => Err(e),
                    Err(_) => Ok(()),
                },
            }
        }
        .boxed();
        let feed = Feed { events: events_tx, errors: errors_tx, kill: Some(kill_tx), stop: stop.clone() };
        state.feeds.entry(collection.to_string()).or_default().push(feed);
        Ok(Subscription::new(listener, stop, events_rx, errors_rx))
    }

    async fn update_record(&self, collection: &str, id: &str, fields: RecordFields) -> Result<(), RecordStoreError> {
        let mut state = self.lock();
        let write =
            WriteRecord::Update { collection: collection.to_string(), id: id.to_string(), fields: fields.clone() };
        if let Err(e) = Self::check_update(&state, &fields) {
            state.failed_writes.push(write);
            return Err(e);
        }
        let record = state.collections.get_mut(collection).and_then(|c| c.get_mut(id)).and_then(Value::as_object_mut);
        let found = match record {
            Some(record) => {
                record.extend(fields);
                true
            },
            None => false,
        };
        if found {
            state.writes.push(write);
            Ok(())
        } else {
            state.failed_writes.push(write);
            Err(RecordStoreError::Rejected { status: 404, message: format!("{collection}/{id} not found") })
        }
    }

    async fn create_record(&self, collection: &str, mut fields: RecordFields) -> Result<String, RecordStoreError> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("rec{:05}", state.next_id);
        let write =
            WriteRecord::Create { collection: collection.to_string(), id: id.clone(), fields: fields.clone() };
        if state.fail_creates {
            state.failed_writes.push(write);
            return Err(RecordStoreError::Rejected { status: 400, message: "create refused".into() });
        }
        fields.insert("id".into(), Value::from(id.as_str()));
        state.collections.entry(collection.to_string()).or_default().insert(id.clone(), Value::Object(fields));
        state.writes.push(write);
        Ok(id)
    }

    async fn fetch_orders_by_filter(
        &self,
        collection: &str,
        filter: &OrderFilter,
    ) -> Result<Vec<Order>, RecordStoreError> {
        let orders = self
            .records(collection)
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Order>(v).ok())
            .filter(|o| filter.matches(o))
            .collect();
        Ok(orders)
    }

    async fn fetch_credit_transactions(
        &self,
        collection: &str,
        user_id: &str,
    ) -> Result<Vec<CreditTransaction>, RecordStoreError> {
        let credits = self
            .records(collection)
            .into_iter()
            .filter_map(|v| serde_json::from_value::<CreditTransaction>(v).ok())
            .filter(|c| c.user_id == user_id)
            .collect();
        Ok(credits)
    }

    async fn close(&self) -> Result<(), RecordStoreError> {
        let mut state = self.lock();
        state.closed = true;
        // Feeds are stopped but kept, so subscribers see their listener finish rather than their channels close
        for feed in state.feeds.values().flatten() {
            feed.stop.stop();
        }
        Ok(())
    }
}
