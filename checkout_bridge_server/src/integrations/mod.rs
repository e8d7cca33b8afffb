pub mod checkout_driver;
pub mod pocketbase;
