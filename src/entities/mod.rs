pub mod checkout_session;
pub mod checkout_session_item;
pub mod entitlement;
pub mod order;
pub mod payment_event;
pub mod product;
pub mod product_ledger;
pub mod seller_ledger;
