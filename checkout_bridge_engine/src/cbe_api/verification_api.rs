use std::{collections::BTreeSet, fmt::Display, sync::Arc};

use chrono::{DateTime, Utc};
use log::*;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    cbe_api::{errors::VerificationError, reconciliation::find_unreconciled_credits},
    db_types::{NewCreditTransaction, Order, OrderFilter, OrderId, OrderStatusType, OrderUpdate},
    events::{CreditMissingEvent, EventProducers, OrderRejectedEvent, PaymentVerifiedEvent, RejectionStage},
    leases::VerificationGate,
    traits::{PaymentVerifier, RecordStore, RecordStoreError, VerificationOutcome},
};

pub const VERIFIED_MESSAGE: &str = "Payment verified from system";
pub const VERIFICATION_FAILED_MESSAGE: &str = "Payment verification failed";
pub const DEFAULT_VERIFY_CONCURRENCY: usize = 16;

/// What a single verification task did to its order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Marked `success` and credited.
    Verified,
    /// Marked `reject`.
    Rejected,
    /// No marker was seen. The order is untouched and will be checked again next tick.
    Ambiguous,
    /// Another task is already verifying this URL. Nothing was done.
    Busy,
}

/// Summary of one pass over the pending orders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRunResult {
    pub started_at: DateTime<Utc>,
    pub pending: usize,
    pub verified: usize,
    pub rejected: usize,
    pub ambiguous: usize,
    pub busy: usize,
    pub failed: usize,
}

impl VerificationRunResult {
    pub fn new(started_at: DateTime<Utc>, pending: usize) -> Self {
        Self { started_at, pending, verified: 0, rejected: 0, ambiguous: 0, busy: 0, failed: 0 }
    }

    pub fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Verified => self.verified += 1,
            TaskOutcome::Rejected => self.rejected += 1,
            TaskOutcome::Ambiguous => self.ambiguous += 1,
            TaskOutcome::Busy => self.busy += 1,
        }
    }
}

impl Display for VerificationRunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pending: {} verified, {} rejected, {} ambiguous, {} busy, {} failed",
            self.pending, self.verified, self.rejected, self.ambiguous, self.busy, self.failed
        )
    }
}

/// `VerificationApi` finalizes orders whose customers have been sent to a checkout page.
///
/// Each pending order's checkout page is checked for a success or failure marker. Success marks the order `success`
/// and appends a credit to the user's ledger; failure marks it `reject`. A page is never checked by two tasks at once.
pub struct VerificationApi<B: ?Sized, V: ?Sized> {
    store: Arc<B>,
    verifier: Arc<V>,
    gate: VerificationGate,
    order_collection: String,
    credit_collection: String,
    max_concurrency: usize,
    producers: EventProducers,
}

impl<B: ?Sized, V: ?Sized> Clone for VerificationApi<B, V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            verifier: Arc::clone(&self.verifier),
            gate: self.gate.clone(),
            order_collection: self.order_collection.clone(),
            credit_collection: self.credit_collection.clone(),
            max_concurrency: self.max_concurrency,
            producers: self.producers.clone(),
        }
    }
}

impl<B: ?Sized, V: ?Sized> VerificationApi<B, V> {
    pub fn new<S: Into<String>>(
        store: Arc<B>,
        verifier: Arc<V>,
        gate: VerificationGate,
        order_collection: S,
        credit_collection: S,
    ) -> Self {
        Self {
            store,
            verifier,
            gate,
            order_collection: order_collection.into(),
            credit_collection: credit_collection.into(),
            max_concurrency: DEFAULT_VERIFY_CONCURRENCY,
            producers: EventProducers::default(),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_producers(mut self, producers: EventProducers) -> Self {
        self.producers = producers;
        self
    }

    pub fn gate(&self) -> &VerificationGate {
        &self.gate
    }
}

impl<B, V> VerificationApi<B, V>
where
    B: RecordStore + ?Sized + 'static,
    V: PaymentVerifier + ?Sized + 'static,
{
    /// Every `user-paying` order that has a checkout URL.
    pub async fn fetch_pending_payments(&self) -> Result<Vec<Order>, VerificationError> {
        let orders =
            self.store.fetch_orders_by_filter(&self.order_collection, &OrderFilter::AwaitingVerification).await?;
        let (pending, stray): (Vec<Order>, Vec<Order>) =
            orders.into_iter().partition(|o| OrderFilter::AwaitingVerification.matches(o));
        if !stray.is_empty() {
            warn!(
                "🔎️ The record store returned {} orders that are not awaiting verification. Ignoring them.",
                stray.len()
            );
        }
        Ok(pending)
    }

    /// Checks a checkout page without changing any records. Fails with [`VerificationError::Busy`] if the page is
    /// already being checked.
    pub async fn verify_by_url(&self, url: &str) -> Result<VerificationOutcome, VerificationError> {
        let _guard = self.gate.try_enter(url)?;
        let outcome = self.verifier.verify_by_url(url).await?;
        Ok(outcome)
    }

    pub async fn update_order_status(
        &self,
        order_id: &OrderId,
        status: OrderStatusType,
        message: &str,
    ) -> Result<(), RecordStoreError> {
        trace!("🔎️ Order [{order_id}] status -> {status}");
        let fields = OrderUpdate::new().status(status).message(message).to_fields();
        self.store.update_record(&self.order_collection, order_id.as_str(), fields).await
    }

    /// Appends the deposit for the order to the credit ledger and returns the new entry's id.
    pub async fn add_credit(&self, credit: &NewCreditTransaction) -> Result<String, RecordStoreError> {
        trace!("🔎️ Crediting {} with {}", credit.user_id, credit.amount);
        self.store.create_record(&self.credit_collection, credit.to_fields()).await
    }

    /// Verifies one order and finalizes it if the page gave a definite answer.
    ///
    /// The URL stays gated until the status and credit writes are done.
    pub async fn verify_order(&self, order: &Order) -> Result<TaskOutcome, VerificationError> {
        if order.payment_url.is_empty() {
            return Err(VerificationError::MissingPaymentUrl(order.id.clone()));
        }
        let Ok(_guard) = self.gate.try_enter(&order.payment_url) else {
            debug!("🔎️ Order [{}] is already being verified. Skipping.", order.id);
            return Ok(TaskOutcome::Busy);
        };
        let outcome = self.verifier.verify_by_url(&order.payment_url).await?;
        match outcome {
            VerificationOutcome::Success => {
                self.update_order_status(&order.id, OrderStatusType::Success, VERIFIED_MESSAGE).await?;
                let credit = NewCreditTransaction::deposit_for(order);
                if let Err(e) = self.add_credit(&credit).await {
                    error!(
                        "🔎️ Order [{}] is marked as paid but {} was NOT credited with {}. This needs to be \
                         reconciled. {e}",
                        order.id, credit.user_id, credit.amount
                    );
                    self.producers.credit_missing(CreditMissingEvent::new(order.clone(), credit, e.to_string())).await;
                    return Err(VerificationError::CreditWrite { order_id: order.id.clone(), source: e });
                }
                info!("🔎️ Order [{}] verified. {} credited with {}", order.id, credit.user_id, credit.amount);
                let mut verified = order.clone();
                verified.status = OrderStatusType::Success;
                verified.message = VERIFIED_MESSAGE.to_string();
                self.producers.payment_verified(PaymentVerifiedEvent::new(verified)).await;
                Ok(TaskOutcome::Verified)
            },
            VerificationOutcome::Failed => {
                self.update_order_status(&order.id, OrderStatusType::Reject, VERIFICATION_FAILED_MESSAGE).await?;
                info!("🔎️ Order [{}] payment failed on the checkout page", order.id);
                let event =
                    OrderRejectedEvent::new(order.clone(), VERIFICATION_FAILED_MESSAGE, RejectionStage::Verification);
                self.producers.order_rejected(event).await;
                Ok(TaskOutcome::Rejected)
            },
            VerificationOutcome::Ambiguous => {
                debug!("🔎️ Order [{}] has no payment result yet", order.id);
                Ok(TaskOutcome::Ambiguous)
            },
        }
    }

    /// One verification pass: every pending order is verified concurrently, at most `max_concurrency` at a time.
    /// A failing task never affects the others.
    pub async fn verify_pending_orders(&self) -> Result<VerificationRunResult, VerificationError> {
        let started_at = Utc::now();
        let orders = self.fetch_pending_payments().await?;
        let mut result = VerificationRunResult::new(started_at, orders.len());
        if orders.is_empty() {
            trace!("🔎️ No orders are awaiting verification");
            return Ok(result);
        }
        debug!("🔎️ Verifying {} pending orders", orders.len());
        let slots = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for order in orders {
            let api = self.clone();
            let slots = Arc::clone(&slots);
            tasks.spawn(async move {
                let _permit = slots.acquire_owned().await;
                let outcome = api.verify_order(&order).await;
                (order.id, outcome)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => result.record(outcome),
                Ok((order_id, Err(e))) => {
                    error!("🔎️ Verification of order [{order_id}] failed. {e}");
                    result.failed += 1;
                },
                Err(e) => {
                    error!("🔎️ A verification task did not complete. {e}");
                    result.failed += 1;
                },
            }
        }
        Ok(result)
    }

    /// `success` orders whose credit never made it into the ledger.
    pub async fn unreconciled_orders(&self) -> Result<Vec<Order>, VerificationError> {
        let paid = self
            .store
            .fetch_orders_by_filter(&self.order_collection, &OrderFilter::WithStatus(OrderStatusType::Success))
            .await?;
        let users = paid.iter().map(|o| o.user_id.as_str()).collect::<BTreeSet<&str>>();
        let mut credits = Vec::new();
        for user in users {
            credits.extend(self.store.fetch_credit_transactions(&self.credit_collection, user).await?);
        }
        Ok(find_unreconciled_credits(&paid, &credits))
    }
}
