use std::{future::Future, pin::Pin, sync::Arc};

use crate::events::{
    channel::DEFAULT_MAX_CONCURRENCY,
    CreditMissingEvent,
    EventHandler,
    EventProducer,
    Handler,
    OrderRejectedEvent,
    OrderSubmittedEvent,
    PaymentVerifiedEvent,
};

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default, Clone)]
pub struct EventProducers {
    pub order_submitted_producer: Vec<EventProducer<OrderSubmittedEvent>>,
    pub order_rejected_producer: Vec<EventProducer<OrderRejectedEvent>>,
    pub payment_verified_producer: Vec<EventProducer<PaymentVerifiedEvent>>,
    pub credit_missing_producer: Vec<EventProducer<CreditMissingEvent>>,
}

impl EventProducers {
    pub async fn order_submitted(&self, event: OrderSubmittedEvent) {
        for producer in &self.order_submitted_producer {
            producer.publish_event(event.clone()).await;
        }
    }

    pub async fn order_rejected(&self, event: OrderRejectedEvent) {
        for producer in &self.order_rejected_producer {
            producer.publish_event(event.clone()).await;
        }
    }

    pub async fn payment_verified(&self, event: PaymentVerifiedEvent) {
        for producer in &self.payment_verified_producer {
            producer.publish_event(event.clone()).await;
        }
    }

    pub async fn credit_missing(&self, event: CreditMissingEvent) {
        for producer in &self.credit_missing_producer {
            producer.publish_event(event.clone()).await;
        }
    }
}

pub struct EventHandlers {
    pub on_order_submitted: Option<EventHandler<OrderSubmittedEvent>>,
    pub on_order_rejected: Option<EventHandler<OrderRejectedEvent>>,
    pub on_payment_verified: Option<EventHandler<PaymentVerifiedEvent>>,
    pub on_credit_missing: Option<EventHandler<CreditMissingEvent>>,
}

impl EventHandlers {
    pub fn new(buffer_size: usize, hooks: EventHooks) -> Self {
        Self::with_concurrency(buffer_size, DEFAULT_MAX_CONCURRENCY, hooks)
    }

    pub fn with_concurrency(buffer_size: usize, max_concurrency: usize, hooks: EventHooks) -> Self {
        let on_order_submitted =
            hooks.on_order_submitted.map(|f| EventHandler::with_concurrency(buffer_size, max_concurrency, f));
        let on_order_rejected =
            hooks.on_order_rejected.map(|f| EventHandler::with_concurrency(buffer_size, max_concurrency, f));
        let on_payment_verified =
            hooks.on_payment_verified.map(|f| EventHandler::with_concurrency(buffer_size, max_concurrency, f));
        let on_credit_missing =
            hooks.on_credit_missing.map(|f| EventHandler::with_concurrency(buffer_size, max_concurrency, f));
        Self { on_order_submitted, on_order_rejected, on_payment_verified, on_credit_missing }
    }

    pub fn producers(&self) -> EventProducers {
        let mut result = EventProducers::default();
        if let Some(handler) = &self.on_order_submitted {
            result.order_submitted_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_order_rejected {
            result.order_rejected_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_payment_verified {
            result.payment_verified_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_credit_missing {
            result.credit_missing_producer.push(handler.subscribe());
        }
        result
    }

    pub async fn start_handlers(self) {
        if let Some(handler) = self.on_order_submitted {
            tokio::spawn(async move {
                handler.start_handler().await;
            });
        }
        if let Some(handler) = self.on_order_rejected {
            tokio::spawn(async move {
                handler.start_handler().await;
            });
        }
        if let Some(handler) = self.on_payment_verified {
            tokio::spawn(async move {
                handler.start_handler().await;
            });
        }
        if let Some(handler) = self.on_credit_missing {
            tokio::spawn(async move {
                handler.start_handler().await;
            });
        }
    }
}

#[derive(Default, Clone)]
pub struct EventHooks {
    pub on_order_submitted: Option<Handler<OrderSubmittedEvent>>,
    pub on_order_rejected: Option<Handler<OrderRejectedEvent>>,
    pub on_payment_verified: Option<Handler<PaymentVerifiedEvent>>,
    pub on_credit_missing: Option<Handler<CreditMissingEvent>>,
}

impl EventHooks {
    pub fn on_order_submitted<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(OrderSubmittedEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_order_submitted = Some(Arc::new(f));
        self
    }

    pub fn on_order_rejected<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(OrderRejectedEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_order_rejected = Some(Arc::new(f));
        self
    }

    pub fn on_payment_verified<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(PaymentVerifiedEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_payment_verified = Some(Arc::new(f));
        self
    }

    /// Fires when an order was marked successful but crediting the user failed.
    pub fn on_credit_missing<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(CreditMissingEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_credit_missing = Some(Arc::new(f));
        self
    }
}
