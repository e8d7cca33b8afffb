mod amount;

pub mod op;
mod secret;

pub use amount::{Amount, AmountParseError, CURRENCY_CODE};
pub use secret::Secret;
