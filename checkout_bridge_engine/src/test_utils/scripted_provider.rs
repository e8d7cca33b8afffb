use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    db_types::{Order, OrderId},
    traits::{CheckoutSession, OtpSubmission, PaymentProvider, PaymentProviderError, PaymentSubmission, ProgressFn},
};

#[derive(Clone, Default)]
struct Script {
    session_error: Option<String>,
    submit_error: Option<String>,
    progress: Vec<u32>,
    submission: Option<PaymentSubmission>,
    otp: Option<OtpSubmission>,
    submit_delay: Duration,
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    submitted: AtomicUsize,
    provider_closed: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// A [`PaymentProvider`] that plays back a fixed script for every session it opens.
///
/// By default sessions open, report no progress, and hand back a checkout page derived from the order id.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Script,
    counters: Arc<Counters>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_session<S: Into<String>>(mut self, reason: S) -> Self {
        self.script.session_error = Some(reason.into());
        self
    }

    pub fn failing_submission<S: Into<String>>(mut self, reason: S) -> Self {
        self.script.submit_error = Some(reason.into());
        self
    }

    /// Progress values reported, in order, during submission.
    pub fn with_progress(mut self, steps: &[u32]) -> Self {
        self.script.progress = steps.to_vec();
        self
    }

    pub fn with_submission(mut self, submission: PaymentSubmission) -> Self {
        self.script.submission = Some(submission);
        self
    }

    pub fn with_otp_result(mut self, result: OtpSubmission) -> Self {
        self.script.otp = Some(result);
        self
    }

    /// How long each submission takes after reporting its progress.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.script.submit_delay = delay;
        self
    }

    /// The checkout page a default session hands out for the order.
    pub fn checkout_url_for(order_id: &OrderId) -> String {
        format!("https://checkout.example/pay/{order_id}")
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> usize {
        self.counters.submitted.load(Ordering::SeqCst)
    }

    pub fn provider_closed(&self) -> bool {
        self.counters.provider_closed.load(Ordering::SeqCst) > 0
    }

    /// The largest number of submissions that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn new_payment(&self, order_id: &OrderId) -> Result<Box<dyn CheckoutSession>, PaymentProviderError> {
        if let Some(reason) = &self.script.session_error {
            return Err(PaymentProviderError::SessionCreation(reason.clone()));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let session = ScriptedSession {
            order_id: order_id.clone(),
            script: self.script.clone(),
            counters: Arc::clone(&self.counters),
        };
        Ok(Box::new(session))
    }

    async fn close(&self) {
        self.counters.provider_closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ScriptedSession {
    order_id: OrderId,
    script: Script,
    counters: Arc<Counters>,
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckoutSession for ScriptedSession {
    async fn submit_payment(
        &self,
        order: &Order,
        on_progress: ProgressFn<'_>,
    ) -> Result<PaymentSubmission, PaymentProviderError> {
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.counters);
        for p in &self.script.progress {
            on_progress(*p);
            tokio::task::yield_now().await;
        }
        if !self.script.submit_delay.is_zero() {
            tokio::time::sleep(self.script.submit_delay).await;
        }
        if let Some(reason) = &self.script.submit_error {
            return Err(PaymentProviderError::Submission(reason.clone()));
        }
        let submission = self.script.submission.clone().unwrap_or_else(|| PaymentSubmission {
            redirect_url: ScriptedProvider::checkout_url_for(&order.id),
            qr_payload: format!("00020101021229370016A000000677010111{}", order.phone_number),
            message: format!("Pay {} with {}", order.amount, order.payment_type),
            external_order_id: format!("EXT-{}", self.order_id),
        });
        Ok(submission)
    }

    async fn submit_otp(&self, _otp: &str) -> Result<OtpSubmission, PaymentProviderError> {
        self.script.otp.clone().ok_or_else(|| PaymentProviderError::Otp("No OTP challenge is pending".into()))
    }

    async fn close(&self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}
