//! The public face of the engine.
//!
//! * [`OrderExportApi`] takes new orders from the record store's change feed and drives them through checkout.
//! * [`VerificationApi`] checks in-flight orders against their checkout pages and finalizes them.
pub mod errors;
pub mod export_api;
pub mod reconciliation;
pub mod verification_api;
