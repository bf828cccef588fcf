use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod payment_webhooks;

/// Routes mounted under `/api/v1`
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/checkout", post(checkout::create_checkout))
        .route("/checkout/:id", get(checkout::get_checkout))
        .route("/checkout/:id/confirm", post(checkout::confirm_checkout))
        .route("/payments/webhook", post(payment_webhooks::payment_webhook))
        .route("/orders", get(orders::list_orders))
        .route("/orders/:id/refund", post(orders::refund_order))
        .route("/entitlements/:product_id", get(orders::get_entitlement))
}
