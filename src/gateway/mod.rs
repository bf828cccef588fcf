pub mod mock;
pub mod stripe;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{config::AppConfig, errors::ServiceError, models::PaymentEvent};

pub use mock::MockGateway;
pub use stripe::StripeGateway;
pub use webhook::{WebhookVerifier, SIGNATURE_HEADER};

/// Context attached to an authorization so callbacks can be traced back to
/// the checkout that created them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationMetadata {
    pub checkout_session_id: Uuid,
    pub buyer_id: String,
    pub item_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub authorization_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Succeeded,
    Failed,
    Pending,
}

/// A verified gateway callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCallback {
    Payment(PaymentEvent),
    /// Authentic, but not something checkout acts on
    Unhandled { event_id: String, event_type: String },
}

/// Payment processor seen from checkout
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authorize(
        &self,
        amount_minor_units: i64,
        currency: &str,
        metadata: &AuthorizationMetadata,
    ) -> Result<Authorization, ServiceError>;

    async fn retrieve_status(&self, authorization_id: &str)
        -> Result<AuthorizationStatus, ServiceError>;

    /// Rejects anything whose signature does not verify with `SignatureError`
    fn verify_callback(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<GatewayCallback, ServiceError>;
}

/// Builds the configured gateway
pub fn build_gateway(config: &AppConfig) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
    let tolerance = Duration::from_secs(config.payment_webhook_tolerance_secs);
    match config.payment_provider.as_str() {
        "stripe" => {
            let api_key = config.payment_gateway_api_key.clone().ok_or_else(|| {
                ServiceError::InternalError("payment_gateway_api_key is not configured".into())
            })?;
            let secret = config.payment_webhook_secret.clone().ok_or_else(|| {
                ServiceError::InternalError("payment_webhook_secret is not configured".into())
            })?;
            let gateway = StripeGateway::new(
                config.payment_gateway_base_url.clone(),
                api_key,
                WebhookVerifier::new(secret, tolerance),
                config.gateway_timeout(),
            )?;
            Ok(Arc::new(gateway))
        }
        "mock" => {
            let secret = config
                .payment_webhook_secret
                .clone()
                .unwrap_or_else(|| mock::DEFAULT_MOCK_SECRET.to_string());
            Ok(Arc::new(MockGateway::new(WebhookVerifier::new(
                secret, tolerance,
            ))))
        }
        other => Err(ServiceError::InternalError(format!(
            "unsupported payment provider: {}",
            other
        ))),
    }
}
