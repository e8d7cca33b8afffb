//! # Collaborator contracts
//!
//! The engine drives three external systems and never talks to any of them directly. Concrete integrations live in
//! the server crate; the engine only sees these traits.
//!
//! * [`RecordStore`] is the backend database. It owns the order and credit ledger records and publishes a realtime
//!   change feed for them.
//! * [`PaymentProvider`] drives the third-party checkout flow. Each order gets its own [`CheckoutSession`].
//! * [`PaymentVerifier`] decides whether a checkout page shows a completed payment. [`PageWatcher`] is the lower-level
//!   primitive that a verifier can be built on.
mod payment_provider;
mod record_store;
mod verifier;

pub use payment_provider::{
    CheckoutSession,
    OtpSubmission,
    PaymentProvider,
    PaymentProviderError,
    PaymentSubmission,
    ProgressFn,
};
pub use record_store::{
    Listener,
    RecordStore,
    RecordStoreError,
    StopListener,
    StopSignal,
    Subscription,
};
pub use verifier::{PageWatcher, PaymentVerifier, VerificationOutcome, VerifierError};
