use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::common::{created_response, success_response};
use crate::{auth::AuthenticatedBuyer, errors::ServiceError, models::CartItem, AppState};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCheckoutRequest {
    #[validate(length(max = 100))]
    pub items: Vec<CartItem>,
    pub currency: Option<String>,
}

// POST /api/v1/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    buyer: AuthenticatedBuyer,
    Json(request): Json<CreateCheckoutRequest>,
) -> Result<Response, ServiceError> {
    request.validate()?;

    let created = state
        .engine
        .create_checkout(
            &buyer.buyer_id,
            &request.items,
            request.currency.as_deref(),
        )
        .await?;
    info!(session_id = %created.session.id, buyer_id = %buyer.buyer_id, "Checkout created");

    Ok(created_response(created))
}

// GET /api/v1/checkout/:id
pub async fn get_checkout(
    State(state): State<AppState>,
    buyer: AuthenticatedBuyer,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let session = state.engine.get_session(id).await?;
    // other buyers' sessions are reported as missing
    if session.buyer_id != buyer.buyer_id {
        return Err(ServiceError::UnknownSession(id));
    }
    Ok(success_response(session))
}

// POST /api/v1/checkout/:id/confirm
pub async fn confirm_checkout(
    State(state): State<AppState>,
    buyer: AuthenticatedBuyer,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let outcome = state.engine.confirm_checkout(id, &buyer.buyer_id).await?;
    Ok(success_response(outcome))
}
