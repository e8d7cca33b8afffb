use chrono::{DateTime, Utc};

use crate::{
    db_types::{NewCreditTransaction, Order},
    traits::PaymentSubmission,
};

/// The export pipeline handed the customer a checkout page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSubmittedEvent {
    pub order: Order,
    pub submission: PaymentSubmission,
}

impl OrderSubmittedEvent {
    pub fn new(order: Order, submission: PaymentSubmission) -> Self {
        Self { order, submission }
    }
}

/// Where in the lifecycle an order was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionStage {
    SessionCreation,
    Submission,
    FinalWrite,
    Verification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRejectedEvent {
    pub order: Order,
    pub reason: String,
    pub stage: RejectionStage,
}

impl OrderRejectedEvent {
    pub fn new<S: Into<String>>(order: Order, reason: S, stage: RejectionStage) -> Self {
        Self { order, reason: reason.into(), stage }
    }
}

/// The checkout page showed a completed payment and the order was marked successful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentVerifiedEvent {
    pub order: Order,
    pub timestamp: DateTime<Utc>,
}

impl PaymentVerifiedEvent {
    pub fn new(order: Order) -> Self {
        Self { order, timestamp: Utc::now() }
    }
}

/// An order was marked successful but its credit could not be written. Somebody needs to reconcile it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditMissingEvent {
    pub order: Order,
    pub credit: NewCreditTransaction,
    pub error: String,
}

impl CreditMissingEvent {
    pub fn new<S: Into<String>>(order: Order, credit: NewCreditTransaction, error: S) -> Self {
        Self { order, credit, error: error.into() }
    }
}
