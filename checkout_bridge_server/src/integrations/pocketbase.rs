//! [`RecordStore`] backed by a PocketBase server.
//!
//! Reads and writes go through the REST API. Subscriptions use PocketBase's realtime endpoint: a server-sent event
//! stream whose first event (`PB_CONNECT`) carries a client id, which is then subscribed to `<collection>/*`.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use checkout_bridge_engine::{
    db_types::{CreditTransaction, Order, OrderFilter, RecordEvent, RecordFields},
    traits::{RecordStore, RecordStoreError, StopListener, StopSignal, Subscription},
};
use futures::FutureExt;
use log::*;
use pocketbase_tools::{PocketBaseApi, PocketBaseApiError, RealtimeConnect, RealtimeStream, PB_CONNECT};
use tokio::{sync::mpsc, task::JoinHandle};

const EVENT_BUFFER_SIZE: usize = 64;

pub fn to_store_error(e: PocketBaseApiError) -> RecordStoreError {
    match e {
        PocketBaseApiError::QueryError { status, message } => RecordStoreError::Rejected { status, message },
        PocketBaseApiError::JsonError(s) => RecordStoreError::Decode(s),
        PocketBaseApiError::RealtimeError(s) => RecordStoreError::SubscriptionClosed(s),
        e => RecordStoreError::Transport(e.to_string()),
    }
}

/// Builds a PocketBase filter literal, escaping any quotes in `value`.
fn quoted(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub struct PocketBaseStore {
    api: PocketBaseApi,
    closed: AtomicBool,
    live_subscriptions: Mutex<Vec<StopSignal>>,
    auth_refresh: Mutex<Option<JoinHandle<()>>>,
}

impl PocketBaseStore {
    pub fn new(api: PocketBaseApi) -> Self {
        Self {
            api,
            closed: AtomicBool::new(false),
            live_subscriptions: Mutex::new(Vec::new()),
            auth_refresh: Mutex::new(None),
        }
    }

    /// Keeps the superuser token fresh until the store is closed.
    pub fn with_auth_refresh(self, every: Duration) -> Self {
        let handle = self.api.spawn_auth_refresh(every);
        *self.auth_refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self
    }

    pub fn api(&self) -> &PocketBaseApi {
        &self.api
    }

    fn check_open(&self) -> Result<(), RecordStoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RecordStoreError::Closed)
        } else {
            Ok(())
        }
    }

    async fn open_realtime(&self, collection: &str) -> Result<RealtimeStream, RecordStoreError> {
        let mut stream = self.api.realtime_connect().await.map_err(to_store_error)?;
        let connect = match stream.next_frame().await {
            Some(Ok(frame)) if frame.event == PB_CONNECT => frame,
            Some(Ok(frame)) => {
                return Err(RecordStoreError::SubscriptionClosed(format!(
                    "Expected {PB_CONNECT} as the first realtime event, but got {}",
                    frame.event
                )))
            },
            Some(Err(e)) => return Err(to_store_error(e)),
            None => return Err(RecordStoreError::SubscriptionClosed("The realtime stream closed immediately".into())),
        };
        let RealtimeConnect { client_id } = serde_json::from_str(&connect.data)?;
        let topics = vec![topic_for(collection)];
        self.api.realtime_subscribe(&client_id, &topics).await.map_err(to_store_error)?;
        info!("🗄️ Realtime client {client_id} listening to {collection}");
        Ok(stream)
    }
}

fn topic_for(collection: &str) -> String {
    format!("{collection}/*")
}

/// Forwards realtime frames for `topic` to `events` until the stream breaks or `stop` fires.
async fn pump_realtime(
    mut stream: RealtimeStream,
    topic: String,
    mut stop: StopListener,
    events: mpsc::Sender<RecordEvent<Order>>,
    errors: mpsc::Sender<RecordStoreError>,
) -> Result<(), RecordStoreError> {
    loop {
        let frame = tokio::select! {
            _ = stop.stopped() => {
                debug!("🗄️ Realtime subscription to {topic} stopped");
                return Ok(());
            },
            frame = stream.next_frame() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                let e = to_store_error(e);
                let _ = errors.send(e.clone()).await;
                return Err(e);
            },
            None => return Err(RecordStoreError::SubscriptionClosed(format!("The {topic} stream ended"))),
        };
        if frame.event != topic {
            trace!("🗄️ Ignoring realtime event {}", frame.event);
            continue;
        }
        match serde_json::from_str::<RecordEvent<Order>>(&frame.data) {
            Ok(event) => {
                trace!("🗄️ Realtime {:?} event for record [{}]", event.action, event.record.id);
                if events.send(event).await.is_err() {
                    debug!("🗄️ Nobody is reading {topic} events any more. Closing the subscription.");
                    return Ok(());
                }
            },
            Err(e) => warn!("🗄️ Skipping undecodable {topic} event. {e}. Data: {}", frame.data),
        }
    }
}

#[async_trait]
impl RecordStore for PocketBaseStore {
    async fn subscribe(&self, collection: &str) -> Result<Subscription<Order>, RecordStoreError> {
        self.check_open()?;
        let stream = self.open_realtime(collection).await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let stop = StopSignal::new();
        {
            let mut live = self.live_subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
            live.retain(|s| !s.is_stopped());
            live.push(stop.clone());
        }
        let listener = pump_realtime(stream, topic_for(collection), stop.listener(), events_tx, errors_tx).boxed();
        Ok(Subscription::new(listener, stop, events_rx, errors_rx))
    }

    async fn update_record(&self, collection: &str, id: &str, fields: RecordFields) -> Result<(), RecordStoreError> {
        self.check_open()?;
        trace!("🗄️ Updating {collection}/{id}");
        self.api.update_record(collection, id, &fields).await.map_err(to_store_error)?;
        Ok(())
    }

    async fn create_record(&self, collection: &str, fields: RecordFields) -> Result<String, RecordStoreError> {
        self.check_open()?;
        let created = self.api.create_record(collection, &fields).await.map_err(to_store_error)?;
        trace!("🗄️ Created {collection}/{}", created.id);
        Ok(created.id)
    }

    async fn fetch_orders_by_filter(
        &self,
        collection: &str,
        filter: &OrderFilter,
    ) -> Result<Vec<Order>, RecordStoreError> {
        self.check_open()?;
        self.api.list_all_records::<Order>(collection, &filter.expression()).await.map_err(to_store_error)
    }

    async fn fetch_credit_transactions(
        &self,
        collection: &str,
        user_id: &str,
    ) -> Result<Vec<CreditTransaction>, RecordStoreError> {
        self.check_open()?;
        let filter = format!("userId={}", quoted(user_id));
        self.api.list_all_records::<CreditTransaction>(collection, &filter).await.map_err(to_store_error)
    }

    async fn close(&self) -> Result<(), RecordStoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let live = std::mem::take(&mut *self.live_subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        live.iter().for_each(StopSignal::stop);
        if let Some(handle) = self.auth_refresh.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        info!("🗄️ PocketBase client closed ({} realtime subscriptions stopped)", live.len());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_values_are_escaped() {
        assert_eq!(quoted("user_1"), "'user_1'");
        assert_eq!(quoted("o'brien"), r"'o\'brien'");
    }

    #[test]
    fn api_errors_map_to_store_errors() {
        let e = to_store_error(PocketBaseApiError::QueryError { status: 404, message: "missing".into() });
        assert!(matches!(e, RecordStoreError::Rejected { status: 404, .. }));
        let e = to_store_error(PocketBaseApiError::RestRequestError("refused".into()));
        assert!(matches!(e, RecordStoreError::Transport(_)));
        let e = to_store_error(PocketBaseApiError::JsonError("bad".into()));
        assert!(matches!(e, RecordStoreError::Decode(_)));
    }

    #[tokio::test]
    async fn closed_store_refuses_work() {
        let config = pocketbase_tools::PocketBaseConfig::new("http://127.0.0.1:1", "a@b.c", "pw");
        let store = PocketBaseStore::new(PocketBaseApi::new(config).unwrap());
        store.close().await.unwrap();
        let err = store.update_record("payment", "abc", RecordFields::new()).await.unwrap_err();
        assert!(matches!(err, RecordStoreError::Closed));
        assert!(matches!(store.subscribe("payment").await, Err(RecordStoreError::Closed)));
    }
}
