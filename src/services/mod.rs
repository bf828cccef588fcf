// Checkout and fulfillment
pub mod cart;
pub mod catalog;
pub mod fulfillment;

// Durable state and payouts
pub mod ledger;
pub mod payout;
