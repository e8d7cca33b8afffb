use checkout_bridge_engine::traits::{PaymentProviderError, RecordStoreError};
use pocketbase_tools::PocketBaseApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Could not initialize the bridge. {0}")]
    InitializeError(String),
    #[error("Invalid bridge configuration. {0}")]
    ConfigurationError(String),
    #[error("PocketBase error. {0}")]
    PocketBaseError(#[from] PocketBaseApiError),
    #[error("Record store error. {0}")]
    RecordStoreError(#[from] RecordStoreError),
    #[error("Checkout driver error. {0}")]
    CheckoutDriverError(#[from] PaymentProviderError),
    #[error("An I/O error happened in the bridge. {0}")]
    IOError(#[from] std::io::Error),
}
