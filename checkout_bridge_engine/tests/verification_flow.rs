use std::{sync::Arc, time::Duration};

use cb_common::Amount;
use checkout_bridge_engine::{
    db_types::{Order, OrderId, OrderStatusType, CREDIT_DESCRIPTION},
    leases::VerificationGate,
    marker_race::{FAILURE_MARKER, SUCCESS_MARKER},
    test_utils::{prepare_env::prepare_test_env, MemoryRecordStore, PageScript, ScriptedWatcher},
    traits::VerificationOutcome,
    MarkerRaceVerifier,
    TaskOutcome,
    VerificationApi,
    VerificationError,
    VERIFICATION_FAILED_MESSAGE,
    VERIFIED_MESSAGE,
};
use rust_decimal_macros::dec;
use serde_json::json;

const ORDERS: &str = "payment";
const CREDITS: &str = "creditTransactions";

type Api = VerificationApi<MemoryRecordStore, MarkerRaceVerifier<ScriptedWatcher>>;

fn setup(watcher: ScriptedWatcher) -> (Api, MemoryRecordStore) {
    prepare_test_env();
    let store = MemoryRecordStore::new();
    let verifier = MarkerRaceVerifier::new(watcher).with_timeout(Duration::from_secs(30));
    let api =
        VerificationApi::new(Arc::new(store.clone()), Arc::new(verifier), VerificationGate::default(), ORDERS, CREDITS);
    (api, store)
}

fn url(id: &str) -> String {
    format!("https://checkout.example/pay/{id}")
}

fn paying_order(store: &MemoryRecordStore, id: &str, user: &str, amount: Amount) -> Order {
    let order =
        Order::new(OrderId::from(id), user, amount).with_status(OrderStatusType::UserPaying).with_payment_url(url(id));
    store.insert_order(ORDERS, &order);
    order
}

#[tokio::test(start_paused = true)]
async fn pending_reads_only_return_orders_with_a_checkout_page() {
    let (api, store) = setup(ScriptedWatcher::new());
    paying_order(&store, "o1", "alice", Amount::from(10));
    let no_url = Order::new("o2".into(), "bob", Amount::from(10)).with_status(OrderStatusType::UserPaying);
    store.insert_order(ORDERS, &no_url);
    let done = Order::new("o3".into(), "carol", Amount::from(10))
        .with_status(OrderStatusType::Success)
        .with_payment_url(url("o3"));
    store.insert_order(ORDERS, &done);
    let pending = api.fetch_pending_payments().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id.as_str(), "o1");
}

#[tokio::test(start_paused = true)]
async fn a_tick_finalizes_what_it_can_and_leaves_the_rest() {
    let watcher = ScriptedWatcher::new()
        .with_page(url("o1"), PageScript::Shows(SUCCESS_MARKER.into()))
        .with_page(url("o2"), PageScript::Shows(SUCCESS_MARKER.into()))
        .with_page(url("o3"), PageScript::Hangs);
    let (api, store) = setup(watcher);
    paying_order(&store, "o1", "alice", Amount::new(dec!(100)));
    paying_order(&store, "o2", "bob", Amount::new(dec!(250.75)));
    paying_order(&store, "o3", "carol", Amount::new(dec!(30)));

    let result = api.verify_pending_orders().await.unwrap();
    assert_eq!(result.pending, 3);
    assert_eq!(result.verified, 2);
    assert_eq!(result.ambiguous, 1);
    assert_eq!(result.failed, 0);

    for id in ["o1", "o2"] {
        let saved = store.order(ORDERS, id).unwrap();
        assert_eq!(saved.status, OrderStatusType::Success);
        assert_eq!(saved.message, VERIFIED_MESSAGE);
    }
    assert_eq!(store.updates_for("o3").len(), 0);
    let credits = store.created_in(CREDITS);
    assert_eq!(credits.len(), 2);
    let bob = credits.iter().find(|c| c["userId"] == json!("bob")).unwrap();
    assert_eq!(bob["amount"], json!(250.75));
    assert_eq!(bob["type"], json!("ADD"));
    assert_eq!(bob["description"], json!(CREDIT_DESCRIPTION));

    // The ambiguous order is picked up again on the next tick
    let pending = api.fetch_pending_payments().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id.as_str(), "o3");
    assert!(api.unreconciled_orders().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failure_marker_rejects_without_credit() {
    let watcher = ScriptedWatcher::new().with_page(url("o1"), PageScript::Shows(FAILURE_MARKER.into()));
    let (api, store) = setup(watcher);
    let order = paying_order(&store, "o1", "alice", Amount::from(5));
    assert_eq!(api.verify_order(&order).await.unwrap(), TaskOutcome::Rejected);
    let saved = store.order(ORDERS, "o1").unwrap();
    assert_eq!(saved.status, OrderStatusType::Reject);
    assert_eq!(saved.message, VERIFICATION_FAILED_MESSAGE);
    assert!(store.created_in(CREDITS).is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_checks_of_one_url_are_refused() {
    let watcher = ScriptedWatcher::new()
        .with_page(url("o1"), PageScript::Shows(SUCCESS_MARKER.into()))
        .with_delay(Duration::from_secs(5));
    let (api, store) = setup(watcher);
    let order = paying_order(&store, "o1", "alice", Amount::from(5));
    let first = {
        let api = api.clone();
        let order = order.clone();
        tokio::spawn(async move { api.verify_order(&order).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(api.gate().is_busy(&order.payment_url));
    assert_eq!(api.verify_order(&order).await.unwrap(), TaskOutcome::Busy);
    assert!(matches!(api.verify_by_url(&order.payment_url).await, Err(VerificationError::Busy(_))));
    assert_eq!(first.await.unwrap().unwrap(), TaskOutcome::Verified);
    assert!(!api.gate().is_busy(&order.payment_url));
    assert_eq!(store.created_in(CREDITS).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn verify_by_url_does_not_write() {
    let watcher = ScriptedWatcher::new().with_page(url("o1"), PageScript::Shows(SUCCESS_MARKER.into()));
    let (api, store) = setup(watcher);
    paying_order(&store, "o1", "alice", Amount::from(5));
    assert_eq!(api.verify_by_url(&url("o1")).await.unwrap(), VerificationOutcome::Success);
    assert!(store.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn credit_failure_is_reported_and_reconcilable() {
    let watcher = ScriptedWatcher::new().with_page(url("o1"), PageScript::Shows(SUCCESS_MARKER.into()));
    let (api, store) = setup(watcher);
    store.fail_creates(true);
    paying_order(&store, "o1", "alice", Amount::from(40));
    let result = api.verify_pending_orders().await.unwrap();
    assert_eq!(result.failed, 1);
    assert_eq!(store.order(ORDERS, "o1").unwrap().status, OrderStatusType::Success);
    let missing = api.unreconciled_orders().await.unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].id.as_str(), "o1");
}

#[tokio::test(start_paused = true)]
async fn broken_pages_fail_only_their_own_task() {
    let watcher = ScriptedWatcher::new()
        .with_page(url("o1"), PageScript::Errors("net::ERR_NAME_NOT_RESOLVED".into()))
        .with_page(url("o2"), PageScript::Shows(SUCCESS_MARKER.into()));
    let (api, store) = setup(watcher);
    paying_order(&store, "o1", "alice", Amount::from(1));
    paying_order(&store, "o2", "bob", Amount::from(2));
    let result = api.verify_pending_orders().await.unwrap();
    assert_eq!(result.failed, 1);
    assert_eq!(result.verified, 1);
    assert_eq!(store.order(ORDERS, "o1").unwrap().status, OrderStatusType::UserPaying);
}

#[tokio::test(start_paused = true)]
async fn verification_concurrency_is_capped() {
    let mut watcher = ScriptedWatcher::new().with_delay(Duration::from_secs(1));
    for i in 0..10 {
        watcher = watcher.with_page(url(&format!("o{i}")), PageScript::Shows(SUCCESS_MARKER.into()));
    }
    let (api, store) = setup(watcher.clone());
    let api = api.with_max_concurrency(3);
    for i in 0..10 {
        paying_order(&store, &format!("o{i}"), "alice", Amount::from(1));
    }
    let result = api.verify_pending_orders().await.unwrap();
    assert_eq!(result.verified, 10);
    // Two watchers per verification
    assert!(watcher.peak_in_flight() <= 6);
}
