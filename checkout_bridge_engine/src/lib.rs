//! Checkout Bridge Engine
//!
//! The engine moves payment orders from a backend record store through a third-party checkout flow, and reconciles
//! the result back into the store. It is provider-agnostic: the record store, the checkout flow and the page checks
//! are all reached through the traits in [`mod@traits`].
//!
//! The library is divided into these main sections:
//! 1. Record types ([`mod@db_types`]). Orders, credit ledger entries and the partial updates the engine writes.
//! 2. Exclusive ownership of in-flight work ([`mod@leases`]). Each order is exported by at most one run at a time,
//!    and each checkout page is verified by at most one task at a time.
//! 3. The public API. [`OrderExportApi`] reacts to new orders; [`VerificationApi`] finalizes them once the customer has
//!    paid (or failed to).
//!
//! The engine also emits events when orders are submitted, rejected or verified, and when a verified order could not
//! be credited. Hook into them with [`events::EventHooks`].
pub mod db_types;
pub mod events;
pub mod leases;
pub mod marker_race;
pub mod traits;

mod cbe_api;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use cbe_api::{
    errors::{ExportError, VerificationError},
    export_api::{ExportOutcome, OrderExportApi},
    reconciliation::find_unreconciled_credits,
    verification_api::{
        TaskOutcome,
        VerificationApi,
        VerificationRunResult,
        DEFAULT_VERIFY_CONCURRENCY,
        VERIFICATION_FAILED_MESSAGE,
        VERIFIED_MESSAGE,
    },
};
pub use marker_race::MarkerRaceVerifier;
