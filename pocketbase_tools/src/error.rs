use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PocketBaseApiError {
    #[error("Could not initialize client: {0}")]
    Initialization(String),
    #[error("Could not send request: {0}")]
    RestRequestError(String),
    #[error("Invalid REST response: {0}")]
    RestResponseError(String),
    #[error("Could not deserialize JSON: {0}")]
    JsonError(String),
    #[error("Query failed. Error {status}. {message}")]
    QueryError { status: u16, message: String },
    #[error("Authentication failed: {0}")]
    AuthError(String),
    #[error("Realtime feed error: {0}")]
    RealtimeError(String),
}
