use std::{
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use cb_common::Amount;
use checkout_bridge_engine::{
    db_types::{Order, OrderId, OrderStatusType, RecordEvent},
    events::{EventHandlers, EventHooks, RejectionStage},
    leases::{SessionRegistry, VerificationGate},
    marker_race::SUCCESS_MARKER,
    test_utils::{prepare_env::prepare_test_env, MemoryRecordStore, PageScript, ScriptedProvider, ScriptedWatcher},
    MarkerRaceVerifier,
    OrderExportApi,
    VerificationApi,
};
use futures::FutureExt;
use log::*;

#[derive(Default, Clone)]
struct HookCalled {
    called: Arc<AtomicI32>,
}

impl HookCalled {
    pub fn called(&self) {
        let _ = self.called.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> i32 {
        self.called.load(Ordering::SeqCst)
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn submitted_and_rejected_hooks_fire() {
    prepare_test_env();
    let submitted = HookCalled::default();
    let rejected = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = EventHooks::default();
    let s = submitted.clone();
    let r = Arc::clone(&rejected);
    hooks
        .on_order_submitted(move |ev| {
            info!("🪝️ Submitted {}", ev.order.id);
            s.called();
            async {}.boxed()
        })
        .on_order_rejected(move |ev| {
            r.lock().unwrap().push(ev.stage);
            async {}.boxed()
        });
    let handlers = EventHandlers::new(8, hooks);
    let producers = handlers.producers();
    handlers.start_handlers().await;

    let store = MemoryRecordStore::new();
    let ok = Order::new(OrderId::from("h1"), "alice", Amount::from(10));
    store.insert_order("payment", &ok);
    let api = OrderExportApi::new(
        Arc::new(store.clone()),
        Arc::new(ScriptedProvider::new()),
        SessionRegistry::default(),
        "payment",
    )
    .with_producers(producers.clone());
    api.process_order_event(RecordEvent::created(ok)).await.unwrap();

    let bad = Order::new(OrderId::from("h2"), "bob", Amount::from(10));
    store.insert_order("payment", &bad);
    let failing = OrderExportApi::new(
        Arc::new(store.clone()),
        Arc::new(ScriptedProvider::new().failing_session("down")),
        SessionRegistry::default(),
        "payment",
    )
    .with_producers(producers);
    failing.process_order_event(RecordEvent::created(bad)).await.unwrap();

    settle().await;
    assert_eq!(submitted.count(), 1);
    assert_eq!(*rejected.lock().unwrap(), vec![RejectionStage::SessionCreation]);
}

#[tokio::test]
async fn verified_and_credit_missing_hooks_fire() {
    prepare_test_env();
    let verified = HookCalled::default();
    let missing = HookCalled::default();
    let mut hooks = EventHooks::default();
    let v = verified.clone();
    let m = missing.clone();
    hooks
        .on_payment_verified(move |ev| {
            assert_eq!(ev.order.status, OrderStatusType::Success);
            v.called();
            async {}.boxed()
        })
        .on_credit_missing(move |ev| {
            info!("🪝️ Credit missing for {}: {}", ev.order.id, ev.error);
            m.called();
            async {}.boxed()
        });
    let handlers = EventHandlers::new(8, hooks);
    let producers = handlers.producers();
    handlers.start_handlers().await;

    let store = MemoryRecordStore::new();
    let watcher = ScriptedWatcher::new()
        .with_page("https://pay/v1", PageScript::Shows(SUCCESS_MARKER.into()))
        .with_page("https://pay/v2", PageScript::Shows(SUCCESS_MARKER.into()));
    let api = VerificationApi::new(
        Arc::new(store.clone()),
        Arc::new(MarkerRaceVerifier::new(watcher)),
        VerificationGate::default(),
        "payment",
        "creditTransactions",
    )
    .with_producers(producers);

    let first = Order::new(OrderId::from("v1"), "alice", Amount::from(10))
        .with_status(OrderStatusType::UserPaying)
        .with_payment_url("https://pay/v1");
    store.insert_order("payment", &first);
    api.verify_order(&first).await.unwrap();

    store.fail_creates(true);
    let second = Order::new(OrderId::from("v2"), "bob", Amount::from(20))
        .with_status(OrderStatusType::UserPaying)
        .with_payment_url("https://pay/v2");
    store.insert_order("payment", &second);
    assert!(api.verify_order(&second).await.is_err());

    settle().await;
    assert_eq!(verified.count(), 1);
    assert_eq!(missing.count(), 1);
}
