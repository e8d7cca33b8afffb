use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::db_types::{CreditTransaction, Order, OrderFilter, RecordEvent, RecordFields};

#[derive(Debug, Clone, Error)]
pub enum RecordStoreError {
    #[error("Could not reach the record store. {0}")]
    Transport(String),
    #[error("The record store rejected the request ({status}). {message}")]
    Rejected { status: u16, message: String },
    #[error("Could not decode the record store response. {0}")]
    Decode(String),
    #[error("The realtime subscription was closed. {0}")]
    SubscriptionClosed(String),
    #[error("The record store client has been closed")]
    Closed,
}

impl From<serde_json::Error> for RecordStoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

//--------------------------------------     StopSignal      ---------------------------------------------------------
/// One-shot, cloneable cancellation switch for a long-running task.
#[derive(Debug, Clone)]
pub struct StopSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender: Arc::new(sender) }
    }

    pub fn stop(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn listener(&self) -> StopListener {
        StopListener { receiver: self.sender.subscribe() }
    }
}

#[derive(Debug, Clone)]
pub struct StopListener {
    receiver: watch::Receiver<bool>,
}

impl StopListener {
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once [`StopSignal::stop`] has been called, or once every [`StopSignal`] has been dropped.
    pub async fn stopped(&mut self) {
        // An Err means the sender is gone, which can only mean we're shutting down.
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }
}

//--------------------------------------    Subscription     ---------------------------------------------------------
/// The future that pumps the realtime feed. It resolves when the feed ends, either cleanly (after a stop) or with an
/// error.
pub type Listener = BoxFuture<'static, Result<(), RecordStoreError>>;

/// A live subscription to a collection's change feed.
///
/// The subscription is inert until `listener` is polled; callers normally spawn it. Change events arrive on `events`.
/// Transport failures that the listener could not recover from are reported on `errors`, after which the feed should
/// be considered dead. Calling `stop.stop()` asks the listener to wind down.
pub struct Subscription<T> {
    pub listener: Listener,
    pub stop: StopSignal,
    pub events: mpsc::Receiver<RecordEvent<T>>,
    pub errors: mpsc::Receiver<RecordStoreError>,
}

impl<T> Subscription<T> {
    pub fn new(
        listener: Listener,
        stop: StopSignal,
        events: mpsc::Receiver<RecordEvent<T>>,
        errors: mpsc::Receiver<RecordStoreError>,
    ) -> Self {
        Self { listener, stop, events, errors }
    }
}

//--------------------------------------     RecordStore     ---------------------------------------------------------
/// The backend record store.
///
/// Writes are always partial: only the supplied fields change. Implementations must be safe to share across tasks.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Opens a realtime subscription to the given collection.
    async fn subscribe(&self, collection: &str) -> Result<Subscription<Order>, RecordStoreError>;

    /// Partially updates a record. Fields that are not in `fields` are left alone.
    async fn update_record(&self, collection: &str, id: &str, fields: RecordFields)
        -> Result<(), RecordStoreError>;

    /// Appends a new record and returns its id.
    async fn create_record(&self, collection: &str, fields: RecordFields) -> Result<String, RecordStoreError>;

    async fn fetch_orders_by_filter(
        &self,
        collection: &str,
        filter: &OrderFilter,
    ) -> Result<Vec<Order>, RecordStoreError>;

    /// Fetches every ledger entry for the given user.
    async fn fetch_credit_transactions(
        &self,
        collection: &str,
        user_id: &str,
    ) -> Result<Vec<CreditTransaction>, RecordStoreError>;

    /// Releases the client. Open subscriptions are stopped.
    async fn close(&self) -> Result<(), RecordStoreError>;
}
