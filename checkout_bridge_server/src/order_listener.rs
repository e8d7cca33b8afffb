//! Supervises the realtime subscription to the order collection.
//!
//! The supervisor keeps exactly one subscription alive. Whenever it fails (the subscribe call itself, the listener
//! future returning, or the store reporting an error) the subscription is stopped and a new one is opened after an
//! exponential backoff delay. It never gives up; the only way out is the stop signal.
//!
//! New-order events are handed to a bounded pool of export jobs. When every slot is busy and the queue is full, reading
//! from the feed pauses until a job finishes.
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use checkout_bridge_engine::{
    db_types::{Order, RecordEvent},
    events::{EventHandler, EventProducer, Handler},
    traits::{PaymentProvider, RecordStore, RecordStoreError, StopListener, Subscription},
    ExportOutcome,
    OrderExportApi,
};
use failsafe::backoff::{self, EqualJittered};
use log::*;
use tokio::{task::JoinHandle, time::Instant};

use crate::config::BackoffConfig;

//--------------------------------------       Backoff       ---------------------------------------------------------
/// Once this many retries have happened the delay is pinned at the cap.
const MAX_DOUBLINGS: u32 = 16;

/// Reconnect delays for the supervisor: doubling from `base` up to `cap`, with equal jitter.
pub struct ReconnectDelays {
    config: BackoffConfig,
    delays: EqualJittered,
    attempts: u32,
}

impl ReconnectDelays {
    pub fn new(config: BackoffConfig) -> Self {
        Self { delays: backoff::equal_jittered(config.base, config.cap), config, attempts: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > MAX_DOUBLINGS {
            self.delays = backoff::equal_jittered(self.config.cap, self.config.cap);
        }
        self.delays.next().unwrap_or(self.config.cap)
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

//--------------------------------------    OrderListener    ---------------------------------------------------------
enum FeedEnd {
    Stopped,
    /// The store wound the subscription down itself, which it only does when it is being closed.
    Released,
    Failed(RecordStoreError),
}

pub struct OrderListener<B: ?Sized, P: ?Sized> {
    api: OrderExportApi<B, P>,
    backoff: BackoffConfig,
    queue_size: usize,
    concurrency: usize,
    reconnects: Arc<AtomicU64>,
}

impl<B, P> OrderListener<B, P>
where
    B: RecordStore + ?Sized + 'static,
    P: PaymentProvider + ?Sized + 'static,
{
    pub fn new(api: OrderExportApi<B, P>, backoff: BackoffConfig, queue_size: usize, concurrency: usize) -> Self {
        Self { api, backoff, queue_size, concurrency, reconnects: Arc::new(AtomicU64::new(0)) }
    }

    /// The number of times the subscription has been (re)started after a failure.
    pub fn reconnect_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.reconnects)
    }

    /// Starts the supervisor. The returned handle completes once `stop` fires.
    pub fn start(self, stop: StopListener) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    fn export_handler(&self) -> EventHandler<RecordEvent<Order>> {
        let api = self.api.clone();
        let handler: Handler<RecordEvent<Order>> = Arc::new(move |event: RecordEvent<Order>| {
            let api = api.clone();
            Box::pin(async move {
                let order_id = event.record.id.clone();
                match api.process_order_event(event).await {
                    Ok(ExportOutcome::Submitted(s)) => {
                        info!("📡️ Order [{order_id}] is waiting for the customer at {}", s.redirect_url)
                    },
                    Ok(ExportOutcome::Rejected { reason }) => info!("📡️ Order [{order_id}] was rejected. {reason}"),
                    Ok(ExportOutcome::Duplicate) => debug!("📡️ Order [{order_id}] is already being exported"),
                    Ok(ExportOutcome::Ignored) => {},
                    Err(e) => error!("📡️ Export of order [{order_id}] failed. {e}"),
                }
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        EventHandler::with_concurrency(self.queue_size, self.concurrency, handler)
    }

    async fn run(self, mut stop: StopListener) {
        let collection = self.api.collection().to_string();
        let jobs = self.export_handler();
        let producer = jobs.subscribe();
        tokio::spawn(jobs.start_handler());
        let mut delays = ReconnectDelays::new(self.backoff);
        info!("📡️ Order listener started on {collection}");
        loop {
            let subscription = tokio::select! {
                _ = stop.stopped() => break,
                res = self.api.store().subscribe(&collection) => res,
            };
            let started = Instant::now();
            let error = match subscription {
                Ok(subscription) => {
                    debug!("📡️ Subscribed to {collection}");
                    let end = forward_events(subscription, &producer, &mut stop).await;
                    if started.elapsed() >= self.backoff.healthy_after {
                        delays.reset();
                    }
                    match end {
                        FeedEnd::Stopped => break,
                        FeedEnd::Released => {
                            debug!("📡️ The record store released the {collection} subscription");
                            continue;
                        },
                        FeedEnd::Failed(e) => e,
                    }
                },
                Err(e) => e,
            };
            if matches!(error, RecordStoreError::Closed) {
                info!("📡️ The record store is closed. Waiting for the shutdown signal.");
                stop.stopped().await;
                break;
            }
            let count = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = delays.next_delay();
            warn!("📡️ Subscription to {collection} failed. {error}. Reconnect #{count} in {delay:?}");
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }
        info!("📡️ Order listener on {collection} stopped");
    }
}

/// Pumps one subscription into the job queue until it fails or we are told to stop.
async fn forward_events(
    subscription: Subscription<Order>,
    jobs: &EventProducer<RecordEvent<Order>>,
    stop: &mut StopListener,
) -> FeedEnd {
    let Subscription { mut listener, stop: unsubscribe, mut events, mut errors } = subscription;
    let end = loop {
        tokio::select! {
            _ = stop.stopped() => break FeedEnd::Stopped,
            res = &mut listener => match res {
                Ok(()) => break FeedEnd::Released,
                Err(e) => break FeedEnd::Failed(e),
            },
            Some(e) = errors.recv() => break FeedEnd::Failed(e),
            event = events.recv() => match event {
                Some(event) => {
                    trace!("📡️ {:?} event for order [{}]", event.action, event.record.id);
                    jobs.publish_event(event).await;
                },
                None => break FeedEnd::Failed(RecordStoreError::SubscriptionClosed("The event feed closed".into())),
            },
        }
    };
    unsubscribe.stop();
    end
}
