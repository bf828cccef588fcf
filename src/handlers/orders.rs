use axum::{
    extract::{Path, State},
    response::Response,
};
use serde::Serialize;
use uuid::Uuid;

use super::common::success_response;
use crate::{
    auth::AuthenticatedBuyer,
    entities::order,
    errors::ServiceError,
    services::ledger::RefundOutcome,
    AppState,
};

#[derive(Debug, Serialize)]
pub struct OrderList {
    pub orders: Vec<order::Model>,
}

#[derive(Debug, Serialize)]
pub struct EntitlementResponse {
    pub product_id: String,
    pub entitled: bool,
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub order: order::Model,
    pub already_refunded: bool,
}

// GET /api/v1/orders
pub async fn list_orders(
    State(state): State<AppState>,
    buyer: AuthenticatedBuyer,
) -> Result<Response, ServiceError> {
    let orders = state
        .engine
        .ledger()
        .orders_for_buyer(&buyer.buyer_id)
        .await?;
    Ok(success_response(OrderList { orders }))
}

// GET /api/v1/entitlements/:product_id
pub async fn get_entitlement(
    State(state): State<AppState>,
    buyer: AuthenticatedBuyer,
    Path(product_id): Path<String>,
) -> Result<Response, ServiceError> {
    let entitled = state
        .engine
        .ledger()
        .has_entitlement(&buyer.buyer_id, &product_id)
        .await?;
    Ok(success_response(EntitlementResponse {
        product_id,
        entitled,
    }))
}

// POST /api/v1/orders/:id/refund
pub async fn refund_order(
    State(state): State<AppState>,
    caller: AuthenticatedBuyer,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    caller.require_admin()?;

    let response = match state.engine.refund_order(id).await? {
        RefundOutcome::Refunded(order) => RefundResponse {
            order,
            already_refunded: false,
        },
        RefundOutcome::AlreadyRefunded(order) => RefundResponse {
            order,
            already_refunded: true,
        },
    };
    Ok(success_response(response))
}
