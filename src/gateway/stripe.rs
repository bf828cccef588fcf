use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{
    webhook::{self, WebhookVerifier},
    Authorization, AuthorizationMetadata, AuthorizationStatus, GatewayCallback, PaymentGateway,
};
use crate::errors::ServiceError;

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    status: String,
    #[serde(default)]
    last_payment_error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: GatewayErrorBody,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Payment intents API client
#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    verifier: WebhookVerifier,
}

impl StripeGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        verifier: WebhookVerifier,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            verifier,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_intent(response: reqwest::Response) -> Result<PaymentIntent, ServiceError> {
        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<ErrorEnvelope>()
                .await
                .ok()
                .map(|body| {
                    body.error
                        .message
                        .or(body.error.code)
                        .unwrap_or_default()
                })
                .unwrap_or_default();
            warn!(%status, %detail, "Payment gateway returned an error");
            return Err(ServiceError::GatewayError(format!(
                "gateway responded {}: {}",
                status, detail
            )));
        }
        response
            .json::<PaymentIntent>()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("unreadable gateway response: {}", e)))
    }
}

fn transport_error(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::GatewayTimeout
    } else {
        ServiceError::GatewayError(err.to_string())
    }
}

fn map_intent_status(intent: &PaymentIntent) -> AuthorizationStatus {
    match intent.status.as_str() {
        "succeeded" => AuthorizationStatus::Succeeded,
        "canceled" => AuthorizationStatus::Failed,
        // A declined attempt leaves the intent open for another payment method
        "requires_payment_method" => {
            if let Some(error) = &intent.last_payment_error {
                debug!(intent_id = %intent.id, %error, "Payment attempt declined; intent still open");
            }
            AuthorizationStatus::Pending
        }
        _ => AuthorizationStatus::Pending,
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    #[instrument(skip(self, metadata), fields(session_id = %metadata.checkout_session_id))]
    async fn authorize(
        &self,
        amount_minor_units: i64,
        currency: &str,
        metadata: &AuthorizationMetadata,
    ) -> Result<Authorization, ServiceError> {
        let form = [
            ("amount", amount_minor_units.to_string()),
            ("currency", currency.to_lowercase()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            (
                "metadata[checkout_session_id]",
                metadata.checkout_session_id.to_string(),
            ),
            ("metadata[buyer_id]", metadata.buyer_id.clone()),
            ("metadata[item_ids]", metadata.item_ids.join(",")),
            ("metadata[item_count]", metadata.item_ids.len().to_string()),
        ];

        let response = self
            .client
            .post(self.url("/v1/payment_intents"))
            .bearer_auth(&self.api_key)
            // one intent per checkout session, even if the request is resent
            .header("Idempotency-Key", metadata.checkout_session_id.to_string())
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let intent = Self::read_intent(response).await?;
        let client_secret = intent.client_secret.ok_or_else(|| {
            ServiceError::GatewayError("payment intent has no client secret".into())
        })?;

        Ok(Authorization {
            authorization_id: intent.id,
            client_secret,
        })
    }

    #[instrument(skip(self))]
    async fn retrieve_status(
        &self,
        authorization_id: &str,
    ) -> Result<AuthorizationStatus, ServiceError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/payment_intents/{}", authorization_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        let intent = Self::read_intent(response).await?;
        Ok(map_intent_status(&intent))
    }

    fn verify_callback(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<GatewayCallback, ServiceError> {
        self.verifier.verify(payload, signature_header)?;
        webhook::parse_callback(payload)
    }
}
