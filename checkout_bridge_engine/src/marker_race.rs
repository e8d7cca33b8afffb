//! Payment verification by racing two page markers.
//!
//! The checkout page eventually shows either a success banner or a failure banner. We watch for both at the same
//! time; whichever appears first decides the outcome. If neither appears before the deadline, the result is
//! [`VerificationOutcome::Ambiguous`] and the order is left for a later pass.
use std::time::Duration;

use async_trait::async_trait;
use log::*;

use crate::traits::{PageWatcher, PaymentVerifier, VerificationOutcome, VerifierError};

pub const SUCCESS_MARKER: &str = "Payment Complete!";
pub const FAILURE_MARKER: &str = "Payment Failed!";
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MarkerRaceVerifier<W> {
    watcher: W,
    timeout: Duration,
    success_marker: String,
    failure_marker: String,
}

impl<W> MarkerRaceVerifier<W>
where W: PageWatcher
{
    pub fn new(watcher: W) -> Self {
        Self {
            watcher,
            timeout: DEFAULT_VERIFY_TIMEOUT,
            success_marker: SUCCESS_MARKER.to_string(),
            failure_marker: FAILURE_MARKER.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_markers<S: Into<String>>(mut self, success: S, failure: S) -> Self {
        self.success_marker = success.into();
        self.failure_marker = failure.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn race(&self, url: &str) -> Result<VerificationOutcome, VerifierError> {
        let success = self.watcher.wait_for_marker(url, &self.success_marker);
        let failure = self.watcher.wait_for_marker(url, &self.failure_marker);
        tokio::pin!(success);
        tokio::pin!(failure);
        let mut success_err = None;
        let mut failure_err = None;
        // A watcher that errors is taken out of the race; the other one may still resolve.
        loop {
            tokio::select! {
                res = &mut success, if success_err.is_none() => match res {
                    Ok(()) => return Ok(VerificationOutcome::Success),
                    Err(e) => {
                        debug!("🔎️ Success watcher for {url} failed: {e}");
                        success_err = Some(e);
                    },
                },
                res = &mut failure, if failure_err.is_none() => match res {
                    Ok(()) => return Ok(VerificationOutcome::Failed),
                    Err(e) => {
                        debug!("🔎️ Failure watcher for {url} failed: {e}");
                        failure_err = Some(e);
                    },
                },
                else => break,
            }
        }
        Err(success_err.or(failure_err).unwrap_or_else(|| VerifierError::Watcher("Both page watchers failed".into())))
    }
}

#[async_trait]
impl<W> PaymentVerifier for MarkerRaceVerifier<W>
where W: PageWatcher
{
    async fn verify_by_url(&self, url: &str) -> Result<VerificationOutcome, VerifierError> {
        trace!("🔎️ Racing payment markers on {url}");
        match tokio::time::timeout(self.timeout, self.race(url)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("🔎️ Neither marker appeared on {url} within {:?}", self.timeout);
                Ok(VerificationOutcome::Ambiguous)
            },
        }
    }
}
