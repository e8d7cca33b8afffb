//! # Checkout bridge
//! This crate hosts the checkout bridge process. It is responsible for:
//! * Listening to the PocketBase realtime feed for new payment orders.
//! * Driving each new order through the checkout driver and writing its progress back to PocketBase.
//! * Periodically verifying orders that are waiting on the customer, and crediting the customer once paid.
//!
//! ## Configuration
//! The bridge is configured via environment variables. See [config](config/index.html) for more information.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod errors;
pub mod integrations;
pub mod order_listener;
pub mod verify_worker;
