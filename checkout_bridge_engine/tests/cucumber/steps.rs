use cb_common::Amount;
use checkout_bridge_engine::{
    db_types::{Order, OrderId, OrderStatusType, PaymentMethod, RecordAction, RecordEvent},
    test_utils::ScriptedProvider,
    ExportOutcome,
};
use cucumber::{given, then, when};
use serde_json::Value;

use crate::cucumber::{checkout_world::ORDERS, CheckoutWorld};

fn parse_list(list: &str) -> Vec<u64> {
    list.split(',').map(|s| s.trim().parse::<u64>().expect("Not a number")).collect()
}

#[given(expr = "a payment provider that reports progress {string}")]
async fn provider_with_progress(world: &mut CheckoutWorld, steps: String) {
    let steps = parse_list(&steps).into_iter().map(|p| p as u32).collect::<Vec<u32>>();
    world.provider = ScriptedProvider::new().with_progress(&steps);
}

#[given(expr = "a payment provider whose sessions fail with {string}")]
async fn provider_failing_sessions(world: &mut CheckoutWorld, reason: String) {
    world.provider = ScriptedProvider::new().failing_session(reason);
}

#[given(expr = "a payment provider whose submissions fail with {string}")]
async fn provider_failing_submissions(world: &mut CheckoutWorld, reason: String) {
    world.provider = ScriptedProvider::new().failing_submission(reason);
}

#[given(expr = "the record store refuses {word} updates")]
async fn store_refuses(world: &mut CheckoutWorld, status: String) {
    let status = status.parse::<OrderStatusType>().expect("Not a valid status");
    world.store.fail_updates_with_status(status);
}

#[given(expr = "order {word} for {int} THB from user {word} paying by {word}")]
async fn existing_order(world: &mut CheckoutWorld, id: String, amount: i64, user: String, method: String) {
    let order = Order::new(OrderId::from(id), user, Amount::from(amount))
        .with_payment_type(PaymentMethod::from(method.as_str()))
        .with_phone_number("0899999999");
    world.store.insert_order(ORDERS, &order);
}

#[when(expr = "a {word} event arrives for order {word}")]
async fn event_arrives(world: &mut CheckoutWorld, action: String, id: String) {
    let order = world.store.order(ORDERS, &id).expect("Order does not exist");
    let action = serde_json::from_value::<RecordAction>(Value::from(action)).expect("Not a valid action");
    let outcome = world.api().process_order_event(RecordEvent { action, record: order }).await;
    world.last_outcome = Some(outcome);
}

#[then(expr = "order {word} has status {word}")]
async fn check_status(world: &mut CheckoutWorld, id: String, status: String) {
    let order = world.store.order(ORDERS, &id).expect("Order does not exist");
    assert_eq!(order.status.to_string(), status);
}

#[then(expr = "order {word} has progress {int}")]
async fn check_progress(world: &mut CheckoutWorld, id: String, progress: u8) {
    let order = world.store.order(ORDERS, &id).expect("Order does not exist");
    assert_eq!(order.progress.value(), progress);
}

#[then(expr = "the progress written for order {word} was {string}")]
async fn check_progress_writes(world: &mut CheckoutWorld, id: String, expected: String) {
    let written = world
        .store
        .updates_for(&id)
        .iter()
        .filter_map(|u| u.get("progress").and_then(Value::as_u64))
        .collect::<Vec<u64>>();
    assert_eq!(written, parse_list(&expected));
}

#[then(expr = "order {word} has a {word}")]
async fn check_field_set(world: &mut CheckoutWorld, id: String, field: String) {
    let order = world.store.order(ORDERS, &id).expect("Order does not exist");
    let value = match field.as_str() {
        "message" => order.message,
        "qrCode" => order.qr_code,
        "paymentUrl" => order.payment_url,
        "orderId" => order.external_order_id,
        _ => panic!("Unknown field {field}"),
    };
    assert!(!value.is_empty(), "{field} is empty");
}

#[then(expr = "order {word} has message {string}")]
async fn check_message(world: &mut CheckoutWorld, id: String, message: String) {
    let order = world.store.order(ORDERS, &id).expect("Order does not exist");
    assert_eq!(order.message, message);
}

#[then(expr = "nothing was written to the record store")]
async fn no_writes(world: &mut CheckoutWorld) {
    assert!(world.store.writes().is_empty());
    assert!(world.store.failed_writes().is_empty());
}

#[then(expr = "{int} checkout sessions were opened and {int} were closed")]
async fn check_sessions(world: &mut CheckoutWorld, opened: usize, closed: usize) {
    assert_eq!(world.provider.opened(), opened);
    assert_eq!(world.provider.closed(), closed);
    assert_eq!(world.registry.active_count(), 0);
}

#[then(expr = "the export was {word}")]
async fn check_outcome(world: &mut CheckoutWorld, outcome: String) {
    let last = world.last_outcome.as_ref().expect("No event has been processed");
    let matched = match (outcome.as_str(), last) {
        ("submitted", Ok(ExportOutcome::Submitted(_))) => true,
        ("rejected", Ok(ExportOutcome::Rejected { .. })) => true,
        ("ignored", Ok(ExportOutcome::Ignored)) => true,
        ("duplicate", Ok(ExportOutcome::Duplicate)) => true,
        ("an_error", Err(_)) => true,
        _ => false,
    };
    assert!(matched, "Expected the export to be {outcome}, but got {last:?}");
}
