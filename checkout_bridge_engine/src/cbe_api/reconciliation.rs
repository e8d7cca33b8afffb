use std::collections::HashMap;

use cb_common::Amount;

use crate::db_types::{CreditTransaction, Order, OrderStatusType, CREDIT_DESCRIPTION};

/// Returns the `success` orders that have no matching deposit in the credit ledger.
///
/// Deposits carry no reference back to their order, so matching is by `(user, amount)` among entries with the deposit
/// description. Each ledger entry can account for at most one order: a user with two verified orders of the same
/// amount needs two deposits.
pub fn find_unreconciled_credits(orders: &[Order], credits: &[CreditTransaction]) -> Vec<Order> {
    let mut available = HashMap::<(&str, Amount), usize>::new();
    for credit in credits.iter().filter(|c| c.description == CREDIT_DESCRIPTION) {
        *available.entry((credit.user_id.as_str(), credit.amount)).or_default() += 1;
    }
    orders
        .iter()
        .filter(|o| o.status == OrderStatusType::Success)
        .filter(|o| match available.get_mut(&(o.user_id.as_str(), o.amount)) {
            Some(n) if *n > 0 => {
                *n -= 1;
                false
            },
            _ => true,
        })
        .cloned()
        .collect()
}
