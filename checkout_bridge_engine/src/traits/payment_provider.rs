use async_trait::async_trait;
use thiserror::Error;

use crate::db_types::{Order, OrderId};

/// Progress callback handed to [`CheckoutSession::submit_payment`]. Values are percentages of the provider's own work
/// and are not guaranteed to be monotonic.
pub type ProgressFn<'a> = &'a (dyn Fn(u32) + Send + Sync);

#[derive(Debug, Clone, Error)]
pub enum PaymentProviderError {
    #[error("Could not open a checkout session. {0}")]
    SessionCreation(String),
    #[error("Payment submission failed. {0}")]
    Submission(String),
    #[error("OTP submission failed. {0}")]
    Otp(String),
    #[error("The checkout session has already been closed")]
    SessionClosed,
    #[error("Could not reach the payment provider. {0}")]
    Transport(String),
}

/// What the provider hands back once the customer has a checkout page to pay on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentSubmission {
    /// The checkout page the customer is redirected to. The verifier watches this page.
    pub redirect_url: String,
    pub qr_payload: String,
    pub message: String,
    /// The provider's own reference for the order
    pub external_order_id: String,
}

/// The result of a second verification step. Providers may issue a fresh checkout page once the OTP is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OtpSubmission {
    pub redirect_url: String,
    pub qr_payload: String,
    pub message: String,
}

/// A single checkout flow, owned by exactly one order.
#[async_trait]
pub trait CheckoutSession: Send + Sync {
    async fn submit_payment(
        &self,
        order: &Order,
        on_progress: ProgressFn<'_>,
    ) -> Result<PaymentSubmission, PaymentProviderError>;

    /// Completes an OTP challenge for flows that require one (e.g. TrueMoney wallet).
    async fn submit_otp(&self, otp: &str) -> Result<OtpSubmission, PaymentProviderError>;

    /// Tears the session down. Must be safe to call more than once.
    async fn close(&self);
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Opens a new, isolated checkout session for the order. Sessions are never shared between orders.
    async fn new_payment(&self, order_id: &OrderId) -> Result<Box<dyn CheckoutSession>, PaymentProviderError>;

    async fn close(&self);
}
