use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::GatewayCallback;
use crate::{entities::payment_event::PaymentOutcome, errors::ServiceError, models::PaymentEvent};

type HmacSha256 = Hmac<Sha256>;

/// Header the gateway signs deliveries with
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Verifies `t=<unix>,v1=<hex>` signatures over `"{t}.{payload}"`
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, ServiceError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("invalid webhook secret: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Builds a header value the way the gateway would
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, ServiceError> {
        let signature = hex::encode(self.mac(timestamp, payload)?.finalize().into_bytes());
        Ok(format!("t={},v1={}", timestamp, signature))
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> Result<(), ServiceError> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<(), ServiceError> {
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| ServiceError::SignatureError("missing or invalid timestamp".into()))?;
        if candidates.is_empty() {
            return Err(ServiceError::SignatureError("missing v1 signature".into()));
        }
        if now.abs_diff(timestamp) > self.tolerance.as_secs() {
            return Err(ServiceError::SignatureError(format!(
                "timestamp {} outside tolerance",
                timestamp
            )));
        }

        for candidate in candidates {
            let Ok(signature) = hex::decode(candidate) else {
                continue;
            };
            // verify_slice compares in constant time
            if self.mac(timestamp, payload)?.verify_slice(&signature).is_ok() {
                return Ok(());
            }
        }

        Err(ServiceError::SignatureError("no matching v1 signature".into()))
    }
}

#[derive(Debug, Deserialize)]
struct GatewayEventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: GatewayEventData,
}

#[derive(Debug, Deserialize)]
struct GatewayEventData {
    object: GatewayObject,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayObject {
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

/// Maps a verified payload to a payment event.
///
/// Events for payment intents that were not created by checkout, and event
/// types checkout does not act on, come back as `Unhandled`.
pub fn parse_callback(payload: &[u8]) -> Result<GatewayCallback, ServiceError> {
    let envelope: GatewayEventEnvelope = serde_json::from_slice(payload)
        .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;

    let outcome = match envelope.event_type.as_str() {
        "payment_intent.succeeded" => PaymentOutcome::Succeeded,
        "payment_intent.payment_failed" => PaymentOutcome::Failed,
        _ => {
            debug!(event_type = %envelope.event_type, "Ignoring gateway event type");
            return Ok(GatewayCallback::Unhandled {
                event_id: envelope.id,
                event_type: envelope.event_type,
            });
        }
    };

    let session_id = envelope
        .data
        .object
        .metadata
        .get("checkout_session_id")
        .and_then(|raw| Uuid::parse_str(raw).ok());

    match session_id {
        Some(session_id) => Ok(GatewayCallback::Payment(PaymentEvent::new(
            envelope.id,
            session_id,
            outcome,
        ))),
        None => {
            warn!(
                event_id = %envelope.id,
                "Payment event without a checkout session id"
            );
            Ok(GatewayCallback::Unhandled {
                event_id: envelope.id,
                event_type: envelope.event_type,
            })
        }
    }
}
