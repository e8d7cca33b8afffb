use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use super::{spawn_sweep_loop, LeaseTable, LeaseToken};
use crate::traits::StopListener;

/// How long a URL stays marked as busy if its verifier never reports back.
pub const DEFAULT_BUSY_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_GATE_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Error)]
#[error("A verification is already running for {0}")]
pub struct GateBusy(pub String);

/// Guarantees that each checkout URL is verified by at most one task at a time.
#[derive(Clone)]
pub struct VerificationGate {
    leases: LeaseTable<String, ()>,
}

impl Default for VerificationGate {
    fn default() -> Self {
        Self::new(DEFAULT_BUSY_TTL)
    }
}

impl VerificationGate {
    pub fn new(busy_ttl: Duration) -> Self {
        Self { leases: LeaseTable::new(busy_ttl) }
    }

    /// Marks the URL as busy. The mark is cleared when the guard is dropped, or after the busy TTL.
    pub fn try_enter(&self, url: &str) -> Result<GateGuard, GateBusy> {
        let (token, _) = self.leases.try_acquire(url.to_string(), ()).map_err(|_| GateBusy(url.to_string()))?;
        Ok(GateGuard { leases: self.leases.clone(), url: url.to_string(), token })
    }

    pub fn is_busy(&self, url: &str) -> bool {
        self.leases.contains(&url.to_string())
    }

    pub fn busy_count(&self) -> usize {
        self.leases.live_count()
    }

    pub fn sweep(&self) -> usize {
        self.leases.sweep_expired().len()
    }

    pub fn start_sweeper(&self, every: Duration, stop: StopListener) -> JoinHandle<()> {
        let gate = self.clone();
        spawn_sweep_loop("Verification gate", every, stop, move || {
            let gate = gate.clone();
            async move { gate.sweep() }
        })
    }
}

/// Holds a URL busy for as long as it lives.
pub struct GateGuard {
    leases: LeaseTable<String, ()>,
    url: String,
    token: LeaseToken,
}

impl GateGuard {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let _ = self.leases.release(&self.url, self.token);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::traits::StopSignal;

    #[tokio::test]
    async fn second_entry_is_refused_until_guard_drops() {
        let gate = VerificationGate::default();
        let guard = gate.try_enter("https://pay.example/a").unwrap();
        assert!(gate.is_busy("https://pay.example/a"));
        assert!(gate.try_enter("https://pay.example/a").is_err());
        assert!(gate.try_enter("https://pay.example/b").is_ok());
        drop(guard);
        assert!(!gate.is_busy("https://pay.example/a"));
        assert!(gate.try_enter("https://pay.example/a").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_entries_expire() {
        let gate = VerificationGate::new(Duration::from_secs(300));
        let guard = gate.try_enter("u").unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!gate.is_busy("u"));
        let _fresh = gate.try_enter("u").unwrap();
        // The stale guard must not clear the fresh entry
        drop(guard);
        assert!(gate.is_busy("u"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_and_stops() {
        let gate = VerificationGate::new(Duration::from_secs(5));
        std::mem::forget(gate.try_enter("leaked").unwrap());
        let stop = StopSignal::new();
        let handle = gate.start_sweeper(Duration::from_secs(10), stop.listener());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(gate.busy_count(), 0);
        assert_eq!(gate.leases.sweep_expired().len(), 0);
        stop.stop();
        handle.await.unwrap();
    }
}
