//! A small client for the parts of the PocketBase API the checkout bridge needs: superuser authentication, record
//! CRUD, filtered listing and the realtime (server-sent events) feed.
mod api;
mod config;
mod data_objects;
mod error;
mod sse;

pub use api::{PocketBaseApi, RealtimeStream, PB_CONNECT};
pub use config::PocketBaseConfig;
pub use data_objects::{AuthResponse, CreateRecordResponse, ListRecordsResponse, RealtimeConnect, SuperUserRecord};
pub use error::PocketBaseApiError;
pub use sse::{SseFrame, SseParser};
