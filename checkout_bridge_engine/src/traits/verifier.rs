use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// The page showed the payment-complete marker.
    Success,
    /// The page showed the payment-failed marker.
    Failed,
    /// Neither marker appeared before the deadline. The payment may still complete.
    Ambiguous,
}

#[derive(Debug, Clone, Error)]
pub enum VerifierError {
    #[error("Page watcher failed. {0}")]
    Watcher(String),
    #[error("Could not reach the verification service. {0}")]
    Transport(String),
}

/// Decides the state of a payment by inspecting its checkout page.
#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify_by_url(&self, url: &str) -> Result<VerificationOutcome, VerifierError>;
}

/// Loads a page and waits for some text to appear on it. Only resolves `Ok` once the marker is visible; a watcher that
/// never sees the marker simply never resolves.
#[async_trait]
pub trait PageWatcher: Send + Sync {
    async fn wait_for_marker(&self, url: &str, marker: &str) -> Result<(), VerifierError>;
}
