use std::{fmt::Debug, sync::Arc};

use log::*;
use tokio::sync::mpsc;

use crate::{
    cbe_api::errors::ExportError,
    db_types::{Order, OrderId, OrderStatusType, OrderUpdate, Progress, RecordEvent},
    events::{EventProducers, OrderRejectedEvent, OrderSubmittedEvent, RejectionStage},
    leases::{SessionHandle, SessionLease, SessionRegistry},
    traits::{
        OtpSubmission,
        PaymentProvider,
        PaymentProviderError,
        PaymentSubmission,
        RecordStore,
        RecordStoreError,
    },
};

/// What happened to a change event handed to [`OrderExportApi::process_order_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// Not a new order, or the order is already finished. Nothing was written.
    Ignored,
    /// Another run for the same order is in flight. Nothing was written.
    Duplicate,
    /// The customer has a checkout page and the order is `user-paying`.
    Submitted(PaymentSubmission),
    /// The order was written as `reject`.
    Rejected { reason: String },
}

/// `OrderExportApi` drives new orders through the payment provider's checkout flow.
///
/// Each run owns its order exclusively: the order is reserved in the [`SessionRegistry`] before anything is written,
/// and the reservation (and the checkout session) is released when the run ends, whatever the outcome.
pub struct OrderExportApi<B: ?Sized, P: ?Sized> {
    store: Arc<B>,
    provider: Arc<P>,
    registry: SessionRegistry,
    collection: String,
    producers: EventProducers,
}

impl<B: ?Sized, P: ?Sized> Clone for OrderExportApi<B, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            registry: self.registry.clone(),
            collection: self.collection.clone(),
            producers: self.producers.clone(),
        }
    }
}

impl<B: ?Sized, P: ?Sized> Debug for OrderExportApi<B, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OrderExportApi({})", self.collection)
    }
}

impl<B: ?Sized, P: ?Sized> OrderExportApi<B, P> {
    pub fn new<S: Into<String>>(store: Arc<B>, provider: Arc<P>, registry: SessionRegistry, collection: S) -> Self {
        Self { store, provider, registry, collection: collection.into(), producers: EventProducers::default() }
    }

    pub fn with_producers(mut self, producers: EventProducers) -> Self {
        self.producers = producers;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn store(&self) -> &B {
        &self.store
    }
}

impl<B, P> OrderExportApi<B, P>
where
    B: RecordStore + ?Sized,
    P: PaymentProvider + ?Sized,
{
    /// Handles one change event from the order collection.
    ///
    /// Only `create` events for `pending` orders are acted on. Everything else is ignored without touching the store
    /// or the provider. Errors are only returned when the run could not leave the order in a
    /// terminal state.
    pub async fn process_order_event(&self, event: RecordEvent<Order>) -> Result<ExportOutcome, ExportError> {
        if !event.is_create() {
            trace!("📦️ Ignoring {:?} event for order [{}]", event.action, event.record.id);
            return Ok(ExportOutcome::Ignored);
        }
        let order = event.record;
        if !order.status.can_transition_to(OrderStatusType::SystemPreparing) {
            debug!("📦️ Order [{}] is already {}. Nothing to export.", order.id, order.status);
            return Ok(ExportOutcome::Ignored);
        }
        let mut lease = match self.registry.reserve(&order.id).await {
            Ok(lease) => lease,
            Err(e) => {
                info!("📦️ {e}. Skipping duplicate create event.");
                return Ok(ExportOutcome::Duplicate);
            },
        };
        debug!(
            "📦️ Exporting order [{}] ({} {} via {})",
            order.id,
            order.amount,
            cb_common::CURRENCY_CODE,
            order.payment_type
        );
        let result = self.run_export(&mut lease, &order).await;
        lease.release().await;
        match &result {
            Ok(ExportOutcome::Submitted(_)) => info!("📦️ Order [{}] is waiting for the customer to pay", order.id),
            Ok(ExportOutcome::Rejected { reason }) => info!("📦️ Order [{}] was rejected. {reason}", order.id),
            Ok(_) => {},
            Err(e) => error!("📦️ Export of order [{}] failed. {e}", order.id),
        }
        result
    }

    async fn run_export(&self, lease: &mut SessionLease, order: &Order) -> Result<ExportOutcome, ExportError> {
        let preparing = OrderUpdate::new().status(OrderStatusType::SystemPreparing).progress(Progress::PREPARING);
        self.write_best_effort(&order.id, &preparing).await;

        let session = match lease.attach(&*self.provider).await {
            Ok(session) => session,
            Err(e) => {
                let reason = format!("Failed to create {} payment: {e}", self.provider.name());
                return self.reject(order, reason, RejectionStage::SessionCreation).await;
            },
        };
        self.write_best_effort(&order.id, &OrderUpdate::new().progress(Progress::SESSION_READY)).await;

        let submission = match self.submit_with_progress(&session, order).await {
            Ok(submission) => submission,
            Err(e) => {
                let reason = format!("Failed to submit payment: {e}");
                return self.reject(order, reason, RejectionStage::Submission).await;
            },
        };

        let paying = OrderUpdate::new()
            .status(OrderStatusType::UserPaying)
            .progress(Progress::COMPLETE)
            .payment_url(submission.redirect_url.as_str())
            .qr_code(submission.qr_payload.as_str())
            .external_order_id(submission.external_order_id.as_str())
            .message(submission.message.as_str());
        if let Err(e) = self.write(&order.id, &paying).await {
            let reason = format!("Failed to update record after payment submission: {e}");
            if let Err(e2) = self.write(&order.id, &OrderUpdate::reject(reason.as_str())).await {
                error!("📦️ Order [{}] could not be marked as rejected either. {e2}", order.id);
            }
            let event = OrderRejectedEvent::new(order.clone(), reason, RejectionStage::FinalWrite);
            self.producers.order_rejected(event).await;
            return Err(ExportError::FinalWrite { order_id: order.id.clone(), source: e });
        }
        self.producers.order_submitted(OrderSubmittedEvent::new(order.clone(), submission.clone())).await;
        Ok(ExportOutcome::Submitted(submission))
    }

    /// Submits the payment while streaming provider progress into the order record. Progress writes never go
    /// backwards, and a report that would not move the bar is dropped.
    async fn submit_with_progress(
        &self,
        session: &SessionHandle,
        order: &Order,
    ) -> Result<PaymentSubmission, PaymentProviderError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        let submit = async move {
            let on_progress = move |p: u32| {
                let _ = tx.send(p);
            };
            session.submit_payment(order, &on_progress).await
        };
        let track = async {
            let mut last = Progress::SESSION_READY;
            while let Some(p) = rx.recv().await {
                let next = Progress::from_provider(p);
                if next <= last {
                    trace!("📦️ Order [{}] dropping stale progress report {p}", order.id);
                    continue;
                }
                last = next;
                self.write_best_effort(&order.id, &OrderUpdate::new().progress(next)).await;
            }
        };
        let (result, ()) = tokio::join!(submit, track);
        result
    }

    async fn reject(
        &self,
        order: &Order,
        reason: String,
        stage: RejectionStage,
    ) -> Result<ExportOutcome, ExportError> {
        warn!("📦️ Rejecting order [{}]. {reason}", order.id);
        self.write(&order.id, &OrderUpdate::reject(reason.as_str())).await?;
        self.producers.order_rejected(OrderRejectedEvent::new(order.clone(), reason.as_str(), stage)).await;
        Ok(ExportOutcome::Rejected { reason })
    }

    /// Forwards an OTP to the live checkout session for the order, and stores whatever checkout details the provider
    /// hands back.
    pub async fn submit_otp(&self, order_id: &OrderId, otp: &str) -> Result<OtpSubmission, ExportError> {
        let session =
            self.registry.session_for(order_id).ok_or_else(|| ExportError::NoActiveSession(order_id.clone()))?;
        debug!("📦️ Submitting OTP for order [{order_id}]");
        let result = session.submit_otp(otp).await?;
        let update = OrderUpdate::new()
            .payment_url(result.redirect_url.as_str())
            .qr_code(result.qr_payload.as_str())
            .message(result.message.as_str());
        self.write(order_id, &update).await?;
        Ok(result)
    }

    async fn write(&self, order_id: &OrderId, update: &OrderUpdate) -> Result<(), RecordStoreError> {
        trace!("📦️ Order [{order_id}] update: {update:?}");
        self.store.update_record(&self.collection, order_id.as_str(), update.to_fields()).await
    }

    async fn write_best_effort(&self, order_id: &OrderId, update: &OrderUpdate) {
        if let Err(e) = self.write(order_id, update).await {
            warn!("📦️ Could not update order [{order_id}]: {e}. Carrying on.");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use async_trait::async_trait;
    use cb_common::Amount;
    use mockall::mock;

    use super::*;
    use crate::{
        db_types::{CreditTransaction, OrderFilter, RecordAction, RecordFields},
        traits::{CheckoutSession, Subscription},
    };

    mock! {
        pub Store {}
        #[async_trait]
        impl RecordStore for Store {
            async fn subscribe(&self, collection: &str) -> Result<Subscription<Order>, RecordStoreError>;
            async fn update_record(&self, collection: &str, id: &str, fields: RecordFields) -> Result<(), RecordStoreError>;
            async fn create_record(&self, collection: &str, fields: RecordFields) -> Result<String, RecordStoreError>;
            async fn fetch_orders_by_filter(&self, collection: &str, filter: &OrderFilter) -> Result<Vec<Order>, RecordStoreError>;
            async fn fetch_credit_transactions(&self, collection: &str, user_id: &str) -> Result<Vec<CreditTransaction>, RecordStoreError>;
            async fn close(&self) -> Result<(), RecordStoreError>;
        }
    }

    mock! {
        pub Provider {}
        #[async_trait]
        impl PaymentProvider for Provider {
            fn name(&self) -> &str;
            async fn new_payment(&self, order_id: &OrderId) -> Result<Box<dyn CheckoutSession>, PaymentProviderError>;
            async fn close(&self);
        }
    }

    fn api(store: MockStore, provider: MockProvider) -> OrderExportApi<MockStore, MockProvider> {
        OrderExportApi::new(Arc::new(store), Arc::new(provider), SessionRegistry::default(), "payment")
    }

    fn order() -> Order {
        Order::new("mock_1".into(), "alice", Amount::from(100))
    }

    #[tokio::test]
    async fn non_create_events_touch_nothing() {
        let mut store = MockStore::new();
        store.expect_update_record().never();
        let mut provider = MockProvider::new();
        provider.expect_new_payment().never();
        let api = api(store, provider);
        for action in [RecordAction::Update, RecordAction::Delete, RecordAction::Unknown] {
            let outcome = api.process_order_event(RecordEvent { action, record: order() }).await.unwrap();
            assert_eq!(outcome, ExportOutcome::Ignored);
        }
        assert_eq!(api.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn duplicates_touch_nothing() {
        let mut store = MockStore::new();
        store.expect_update_record().never();
        let mut provider = MockProvider::new();
        provider.expect_new_payment().never();
        let api = api(store, provider);
        let held = api.registry().reserve(&order().id).await.unwrap();
        let outcome = api.process_order_event(RecordEvent::created(order())).await.unwrap();
        assert_eq!(outcome, ExportOutcome::Duplicate);
        held.release().await;
    }

    #[tokio::test]
    async fn session_failure_writes_preparing_then_reject() {
        let mut seq = mockall::Sequence::new();
        let mut store = MockStore::new();
        store
            .expect_update_record()
            .withf(|_, _, fields| fields.get("status").and_then(|s| s.as_str()) == Some("system-preparing"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        store
            .expect_update_record()
            .withf(|_, id, fields| id == "mock_1" && fields.get("status").and_then(|s| s.as_str()) == Some("reject"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        let mut provider = MockProvider::new();
        provider.expect_name().return_const("mock".to_string());
        provider
            .expect_new_payment()
            .times(1)
            .returning(|_| Err(PaymentProviderError::SessionCreation("no browser".into())));
        let outcome = api(store, provider).process_order_event(RecordEvent::created(order())).await.unwrap();
        let ExportOutcome::Rejected { reason } = outcome else { panic!("Expected a rejection") };
        assert_eq!(reason, "Failed to create mock payment: Could not open a checkout session. no browser");
    }
}
