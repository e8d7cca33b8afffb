use std::time::Duration;

use checkout_bridge_engine::{
    traits::{PaymentVerifier, RecordStore, StopListener},
    VerificationApi,
};
use log::*;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

/// Starts the verification worker. It runs a verification pass every `interval` until `stop` fires. A pass that is
/// still running when `stop` fires is allowed to finish.
pub fn start_verification_worker<B, V>(
    api: VerificationApi<B, V>,
    interval: Duration,
    mut stop: StopListener,
) -> JoinHandle<()>
where
    B: RecordStore + ?Sized + 'static,
    V: PaymentVerifier + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        // A slow pass must not be followed by a burst of catch-up passes
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("🕰️ Payment verification worker started. Running every {interval:?}");
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                _ = timer.tick() => {},
            }
            debug!("🕰️ Running payment verification job");
            match api.verify_pending_orders().await {
                Ok(result) if result.pending == 0 => trace!("🕰️ Nothing to verify"),
                Ok(result) => info!("🕰️ Verification pass finished. {result}"),
                Err(e) => error!("🕰️ Error running payment verification job: {e}"),
            }
        }
        info!("🕰️ Payment verification worker stopped");
    })
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use cb_common::Amount;
    use checkout_bridge_engine::{
        db_types::{Order, OrderStatusType},
        leases::VerificationGate,
        test_utils::{MemoryRecordStore, PageScript, ScriptedWatcher},
        traits::StopSignal,
        MarkerRaceVerifier,
    };

    use super::*;

    const ORDERS: &str = "payment";
    const CREDITS: &str = "creditTransactions";

    fn paying(id: &str, url: &str) -> Order {
        Order::new(id.into(), "bob", Amount::from(250))
            .with_status(OrderStatusType::UserPaying)
            .with_payment_url(url)
    }

    #[tokio::test(start_paused = true)]
    async fn passes_run_on_every_tick_until_stopped() {
        let store = MemoryRecordStore::new();
        store.insert_order(ORDERS, &paying("v1", "https://pay/v1"));
        store.insert_order(ORDERS, &paying("v2", "https://pay/v2"));
        let watcher = ScriptedWatcher::new()
            .with_page("https://pay/v1", PageScript::Shows("Payment Complete!".into()))
            .with_page("https://pay/v2", PageScript::Hangs);
        let verifier = MarkerRaceVerifier::new(watcher.clone()).with_timeout(Duration::from_secs(30));
        let gate = VerificationGate::default();
        let api = VerificationApi::new(Arc::new(store.clone()), Arc::new(verifier), gate, ORDERS, CREDITS);
        let signal = StopSignal::new();
        let handle = start_verification_worker(api, Duration::from_secs(60), signal.listener());

        // The first tick fires straight away
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(store.order(ORDERS, "v1").unwrap().status, OrderStatusType::Success);
        assert_eq!(store.order(ORDERS, "v2").unwrap().status, OrderStatusType::UserPaying);
        assert_eq!(store.created_in(CREDITS).len(), 1);
        let first_pass_calls = watcher.calls();

        // v2 is still pending and gets another look on the next tick
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(watcher.calls() > first_pass_calls);
        assert_eq!(store.created_in(CREDITS).len(), 1);

        signal.stop();
        handle.await.unwrap();
        let calls = watcher.calls();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(watcher.calls(), calls);
    }
}
