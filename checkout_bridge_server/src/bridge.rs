//! Wiring and lifecycle of the bridge process.
//!
//! [`run_bridge`] builds the PocketBase store and the checkout driver from the configuration, starts every background
//! task through [`Bridge::start`], and then waits for SIGINT or SIGTERM. The shutdown sequence is fixed: close the
//! record store, close the checkout provider, stop the listener, the verification worker and the lease sweepers, and
//! finally give in-flight work a grace period before returning.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use checkout_bridge_engine::{
    events::{CreditMissingEvent, EventHandlers, EventHooks, OrderRejectedEvent, PaymentVerifiedEvent},
    leases::{SessionRegistry, VerificationGate},
    traits::{PaymentProvider, PaymentVerifier, RecordStore, StopSignal},
    MarkerRaceVerifier,
    OrderExportApi,
    VerificationApi,
};
use log::*;
use pocketbase_tools::PocketBaseApi;
use tokio::task::JoinHandle;

use crate::{
    config::BridgeConfig,
    errors::ServerError,
    integrations::{checkout_driver::CheckoutDriver, pocketbase::PocketBaseStore},
    order_listener::OrderListener,
    verify_worker::start_verification_worker,
};

pub const BRIDGE_EVENT_BUFFER_SIZE: usize = 25;

pub async fn run_bridge(config: BridgeConfig) -> Result<(), ServerError> {
    let api = PocketBaseApi::connect(config.pocketbase.clone())
        .await
        .map_err(|e| ServerError::InitializeError(format!("Could not log in to PocketBase. {e}")))?;
    let store = PocketBaseStore::new(api).with_auth_refresh(config.auth_refresh_interval);
    let driver = CheckoutDriver::new(config.checkout_driver_url.as_str(), config.provider_name.as_str())?
        .with_request_timeout(config.driver_timeout)?
        .with_watch_timeout(config.verify_timeout);
    let verifier = MarkerRaceVerifier::new(driver.clone())
        .with_timeout(config.verify_timeout)
        .with_markers(config.success_marker.as_str(), config.failure_marker.as_str());
    let bridge = Bridge::start(&config, Arc::new(store), Arc::new(driver), Arc::new(verifier)).await;
    shutdown_signal().await?;
    info!("🚀️ Shutdown signal received");
    bridge.shutdown(config.shutdown_grace).await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<(), ServerError> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<(), ServerError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Hooks that report noteworthy order events in the log.
///
/// 1. OrderRejected - the order was rejected, either during export or verification.
/// 2. PaymentVerified - the customer paid and has been credited.
/// 3. CreditMissing - the order was marked as paid, but the credit could not be written. This needs a human.
pub fn create_bridge_event_handlers() -> EventHandlers {
    let mut hooks = EventHooks::default();
    hooks.on_order_rejected(|ev| {
        let OrderRejectedEvent { order, reason, stage } = ev;
        Box::pin(async move {
            warn!("📬️ Order [{}] for user {} rejected during {stage:?}. {reason}", order.id, order.user_id);
        })
    });
    hooks.on_payment_verified(|ev| {
        let PaymentVerifiedEvent { order, timestamp } = ev;
        Box::pin(async move {
            info!("📬️ Order [{}] paid. {} credited to user {} at {timestamp}", order.id, order.amount, order.user_id);
        })
    });
    hooks.on_credit_missing(|ev| {
        let CreditMissingEvent { order, credit, error } = ev;
        Box::pin(async move {
            error!(
                "🚨️ Order [{}] is marked as paid but user {} was NOT credited {}. Manual reconciliation is required. \
                 {error}",
                order.id, credit.user_id, credit.amount
            );
        })
    });
    EventHandlers::new(BRIDGE_EVENT_BUFFER_SIZE, hooks)
}

/// The running bridge: every background task and the handles needed to shut them down.
pub struct Bridge {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn PaymentProvider>,
    stop: StopSignal,
    registry: SessionRegistry,
    gate: VerificationGate,
    reconnects: Arc<AtomicU64>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    pub async fn start(
        config: &BridgeConfig,
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn PaymentProvider>,
        verifier: Arc<dyn PaymentVerifier>,
    ) -> Self {
        let stop = StopSignal::new();
        let handlers = create_bridge_event_handlers();
        let producers = handlers.producers();
        handlers.start_handlers().await;

        let registry = SessionRegistry::new(config.session_ttl);
        let gate = VerificationGate::new(config.gate_ttl);
        let mut tasks = vec![
            registry.start_sweeper(config.session_sweep_interval, stop.listener()),
            gate.start_sweeper(config.gate_sweep_interval, stop.listener()),
        ];

        let export_api =
            OrderExportApi::new(Arc::clone(&store), Arc::clone(&provider), registry.clone(), &config.order_collection)
                .with_producers(producers.clone());
        let listener =
            OrderListener::new(export_api, config.backoff, config.export_queue_size, config.export_concurrency);
        let reconnects = listener.reconnect_counter();
        tasks.push(listener.start(stop.listener()));

        let verification_api = VerificationApi::new(
            Arc::clone(&store),
            verifier,
            gate.clone(),
            config.order_collection.as_str(),
            config.credit_collection.as_str(),
        )
        .with_max_concurrency(config.verify_concurrency)
        .with_producers(producers);
        tasks.push(report_unreconciled_orders(verification_api.clone()));
        tasks.push(start_verification_worker(verification_api, config.verify_interval, stop.listener()));

        info!("🚀️ Checkout bridge is running");
        Self { store, provider, stop, registry, gate, reconnects, tasks }
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.active_count()
    }

    pub fn busy_urls(&self) -> usize {
        self.gate.busy_count()
    }

    /// Runs the shutdown sequence. In-flight exports and verifications are not cancelled; they get `grace` to finish.
    pub async fn shutdown(self, grace: Duration) {
        info!("🚀️ Shutting down. Closing the record store");
        if let Err(e) = self.store.close().await {
            warn!("🚀️ The record store did not close cleanly. {e}");
        }
        info!("🚀️ Closing the {} checkout provider", self.provider.name());
        self.provider.close().await;
        info!("🚀️ Stopping background tasks");
        self.stop.stop();
        debug!("🚀️ Waiting {grace:?} for in-flight work ({} open sessions)", self.registry.active_count());
        tokio::time::sleep(grace).await;
        let unfinished = self.tasks.iter().filter(|t| !t.is_finished()).count();
        if unfinished > 0 {
            warn!("🚀️ {unfinished} background tasks were still running at exit");
        }
        info!("🚀️ Checkout bridge stopped");
    }
}

/// Logs every paid order that is missing its credit. Runs once, at start-up.
fn report_unreconciled_orders<B, V>(api: VerificationApi<B, V>) -> JoinHandle<()>
where
    B: RecordStore + ?Sized + 'static,
    V: PaymentVerifier + ?Sized + 'static,
{
    tokio::spawn(async move {
        match api.unreconciled_orders().await {
            Ok(orders) if orders.is_empty() => debug!("🔎️ Every paid order has a matching credit"),
            Ok(orders) => {
                for order in orders {
                    error!(
                        "🚨️ Order [{}] is marked as paid but user {} has no matching credit of {}",
                        order.id, order.user_id, order.amount
                    );
                }
            },
            Err(e) => warn!("🔎️ Could not check paid orders against the credit ledger. {e}"),
        }
    })
}
