use axum::{extract::State, http::HeaderMap, response::Response};
use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use tracing::{error, info, warn};

use super::common::success_response;
use crate::{
    errors::ServiceError,
    gateway::{GatewayCallback, SIGNATURE_HEADER},
    services::fulfillment::FinalizeResult,
    AppState,
};

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalizeResult>,
    /// Set when the event was accepted but needs manual reconciliation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<&'static str>,
}

impl WebhookAck {
    fn received(result: Option<FinalizeResult>) -> Self {
        Self {
            received: true,
            result,
            reconciliation: None,
        }
    }
}

fn rejected_signature(reason: &str) -> ServiceError {
    warn!(reason, "Payment webhook signature rejected");
    counter!("promptmarket_webhooks.signature_rejections", 1);
    ServiceError::SignatureError(reason.to_string())
}

// POST /api/v1/payments/webhook
//
// 2xx tells the gateway to stop redelivering, so only transient failures
// surface as errors here.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| rejected_signature("missing signature header"))?;

    let callback = state
        .engine
        .gateway()
        .verify_callback(&body, signature)
        .map_err(|err| match err {
            ServiceError::SignatureError(reason) => rejected_signature(&reason),
            other => other,
        })?;

    let event = match callback {
        GatewayCallback::Unhandled {
            event_id,
            event_type,
        } => {
            info!(%event_id, %event_type, "Ignoring unhandled payment webhook");
            return Ok(success_response(WebhookAck::received(None)));
        }
        GatewayCallback::Payment(event) => event,
    };

    let event_id = event.gateway_event_id.clone();
    match state.engine.finalize(event).await {
        Ok(result) => {
            counter!("promptmarket_webhooks.processed", 1);
            Ok(success_response(WebhookAck::received(Some(result))))
        }
        Err(err @ (ServiceError::UnknownSession(_) | ServiceError::SessionExpired(_))) => {
            error!(%event_id, error = %err, "Payment webhook needs reconciliation");
            Ok(success_response(WebhookAck {
                received: true,
                result: None,
                reconciliation: Some(err.code()),
            }))
        }
        Err(err) => {
            warn!(%event_id, error = %err, "Payment webhook failed; gateway will redeliver");
            Err(err)
        }
    }
}
