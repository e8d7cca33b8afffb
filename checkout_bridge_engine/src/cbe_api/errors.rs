use thiserror::Error;

use crate::{
    db_types::OrderId,
    leases::GateBusy,
    traits::{PaymentProviderError, RecordStoreError, VerifierError},
};

#[derive(Debug, Clone, Error)]
pub enum ExportError {
    #[error("Record store error: {0}")]
    Store(#[from] RecordStoreError),
    #[error("Payment was submitted for order {order_id} but the result could not be saved. {source}")]
    FinalWrite { order_id: OrderId, source: RecordStoreError },
    #[error("There is no live checkout session for order {0}")]
    NoActiveSession(OrderId),
    #[error("Payment provider error: {0}")]
    Provider(#[from] PaymentProviderError),
}

#[derive(Debug, Clone, Error)]
pub enum VerificationError {
    #[error("Record store error: {0}")]
    Store(#[from] RecordStoreError),
    #[error("Verifier error: {0}")]
    Verifier(#[from] VerifierError),
    #[error("{0}")]
    Busy(#[from] GateBusy),
    #[error("Order {order_id} was marked successful but its credit could not be written. {source}")]
    CreditWrite { order_id: OrderId, source: RecordStoreError },
    #[error("Order {0} has no payment URL to verify")]
    MissingPaymentUrl(OrderId),
}
