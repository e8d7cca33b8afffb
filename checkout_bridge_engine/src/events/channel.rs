//! Bounded pub-sub event dispatch
//!
//! Components publish events through an [`EventProducer`]; a single [`EventHandler`] receives them and runs the
//! handler function for each one in its own task. Handlers are stateless: all they get is the event.
//!
//! The number of handler tasks in flight is capped. When the cap is reached, the handler stops pulling from the
//! channel, the channel fills up, and producers wait in `publish_event`. Nothing is dropped.
use std::{future::Future, pin::Pin, sync::Arc};

use log::*;
use tokio::sync::{mpsc, Semaphore};

pub type Handler<E> = Arc<dyn Fn(E) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// The default number of handler tasks allowed to run at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;
const MAX_CONCURRENCY_LIMIT: u32 = 10_000;

pub struct EventHandler<E: Send + Sync + 'static> {
    listener: mpsc::Receiver<E>,
    sender: mpsc::Sender<E>,
    handler: Handler<E>,
    max_concurrency: usize,
}

impl<E: Send + Sync + 'static> EventHandler<E> {
    pub fn new(buffer_size: usize, handler: Handler<E>) -> Self {
        Self::with_concurrency(buffer_size, DEFAULT_MAX_CONCURRENCY, handler)
    }

    pub fn with_concurrency(buffer_size: usize, max_concurrency: usize, handler: Handler<E>) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let max_concurrency = max_concurrency.clamp(1, MAX_CONCURRENCY_LIMIT as usize);
        Self { listener: receiver, sender, handler, max_concurrency }
    }

    pub fn subscribe(&self) -> EventProducer<E> {
        EventProducer::new(self.sender.clone())
    }

    /// Runs until every producer has been dropped and all in-flight handlers have finished.
    pub async fn start_handler(mut self) {
        debug!("📬️ Starting event handler (max {} concurrent jobs)", self.max_concurrency);
        // Drop our own sender so that the loop ends when the last producer goes away
        drop(self.sender);
        let slots = Arc::new(Semaphore::new(self.max_concurrency));
        while let Some(ev) = self.listener.recv().await {
            let permit = match Arc::clone(&slots).acquire_owned().await {
                Ok(p) => p,
                Err(e) => {
                    error!("📬️ Event handler job slots closed unexpectedly: {e}");
                    break;
                },
            };
            trace!("📬️ Handling event");
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                (handler)(ev).await;
                drop(permit);
                trace!("📬️ Event handled");
            });
        }
        debug!("📬️ Waiting for in-flight jobs to complete");
        let all_slots = u32::try_from(self.max_concurrency).unwrap_or(MAX_CONCURRENCY_LIMIT);
        match slots.acquire_many(all_slots).await {
            Ok(_) => debug!("📬️ Event handler shutting down gracefully"),
            Err(e) => warn!("📬️ Event handler could not wait for in-flight jobs: {e}"),
        }
        debug!("📬️ Event handler has shut down");
    }
}

#[derive(Clone)]
pub struct EventProducer<E: Send + Sync> {
    sender: mpsc::Sender<E>,
}

impl<E: Send + Sync> EventProducer<E> {
    pub fn new(sender: mpsc::Sender<E>) -> Self {
        Self { sender }
    }

    /// Queues the event. Waits if the handler is saturated.
    pub async fn publish_event(&self, event: E) {
        if let Err(e) = self.sender.send(event).await {
            error!("📬️ Failed to send event: {e}");
        }
    }
}
