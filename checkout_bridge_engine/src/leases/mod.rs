//! Exclusive, time-limited ownership of in-flight work.
//!
//! Two places in the bridge need to guarantee "at most one worker per key":
//! * the export pipeline, which must never run twice for the same order ([`SessionRegistry`]), and
//! * the verifier, which must never watch the same checkout page twice concurrently ([`VerificationGate`]).
//!
//! Both are thin wrappers over [`LeaseTable`].
mod lease_table;
mod session_registry;
mod verification_gate;

use std::time::Duration;

pub use lease_table::{LeaseError, LeaseTable, LeaseToken};
use log::*;
pub use session_registry::{SessionHandle, SessionLease, SessionRegistry, SessionRegistryError};
use tokio::task::JoinHandle;
pub use verification_gate::{GateBusy, GateGuard, VerificationGate};

use crate::traits::StopListener;

/// Runs `sweep` every `every` until `stop` fires. Do not await the returned JoinHandle unless you have stopped it.
pub(crate) fn spawn_sweep_loop<F, Fut>(
    name: &'static str,
    every: Duration,
    mut stop: StopListener,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = usize> + Send,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        // The first tick completes immediately
        timer.tick().await;
        info!("🔐️ {name} sweeper started");
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let swept = sweep().await;
                    if swept > 0 {
                        debug!("🔐️ {name} sweeper evicted {swept} expired entries");
                    } else {
                        trace!("🔐️ {name} sweeper found nothing to evict");
                    }
                },
                _ = stop.stopped() => {
                    info!("🔐️ {name} sweeper stopped");
                    break;
                },
            }
        }
    })
}
