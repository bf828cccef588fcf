pub mod checkout;

pub use checkout::{CartItem, CheckoutSession, PaymentEvent};
