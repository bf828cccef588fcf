use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use uuid::Uuid;

use super::{
    webhook::{self, WebhookVerifier},
    Authorization, AuthorizationMetadata, AuthorizationStatus, GatewayCallback, PaymentGateway,
};
use crate::errors::ServiceError;

pub const DEFAULT_MOCK_SECRET: &str = "whsec_mock_local_development";

/// Next scripted result of `authorize`
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Approve,
    Decline(String),
    /// Sleeps before answering, to exercise caller timeouts
    Delay(Duration),
}

/// In-process gateway for local development and tests.
///
/// Authorizations are deterministic (`pi_mock_<n>`) and start `Pending`;
/// tests drive them with [`MockGateway::set_status`] and deliver signed
/// callbacks built by [`MockGateway::signed_event`].
#[derive(Clone)]
pub struct MockGateway {
    verifier: WebhookVerifier,
    sequence: Arc<AtomicU64>,
    behavior: Arc<Mutex<MockBehavior>>,
    statuses: Arc<DashMap<String, AuthorizationStatus>>,
    authorizations: Arc<DashMap<String, AuthorizationMetadata>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new(WebhookVerifier::new(
            DEFAULT_MOCK_SECRET,
            Duration::from_secs(300),
        ))
    }
}

impl MockGateway {
    pub fn new(verifier: WebhookVerifier) -> Self {
        Self {
            verifier,
            sequence: Arc::new(AtomicU64::new(0)),
            behavior: Arc::new(Mutex::new(MockBehavior::Approve)),
            statuses: Arc::new(DashMap::new()),
            authorizations: Arc::new(DashMap::new()),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        if let Ok(mut current) = self.behavior.lock() {
            *current = behavior;
        }
    }

    pub fn set_status(&self, authorization_id: &str, status: AuthorizationStatus) {
        self.statuses.insert(authorization_id.to_string(), status);
    }

    pub fn authorization_count(&self) -> usize {
        self.authorizations.len()
    }

    pub fn metadata(&self, authorization_id: &str) -> Option<AuthorizationMetadata> {
        self.authorizations
            .get(authorization_id)
            .map(|entry| entry.clone())
    }

    /// Signature header for `payload`, timestamped now
    pub fn sign(&self, payload: &[u8]) -> Result<String, ServiceError> {
        self.verifier.sign(payload, Utc::now().timestamp())
    }

    /// Gateway-shaped JSON for a payment intent outcome
    pub fn event_payload(event_id: &str, event_type: &str, checkout_session_id: Uuid) -> Vec<u8> {
        serde_json::json!({
            "id": event_id,
            "object": "event",
            "type": event_type,
            "data": {
                "object": {
                    "object": "payment_intent",
                    "metadata": { "checkout_session_id": checkout_session_id.to_string() }
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    /// Payload plus a valid signature header
    pub fn signed_event(
        &self,
        event_id: &str,
        event_type: &str,
        checkout_session_id: Uuid,
    ) -> Result<(Vec<u8>, String), ServiceError> {
        let payload = Self::event_payload(event_id, event_type, checkout_session_id);
        let header = self.sign(&payload)?;
        Ok((payload, header))
    }

    fn current_behavior(&self) -> MockBehavior {
        self.behavior
            .lock()
            .map(|behavior| behavior.clone())
            .unwrap_or(MockBehavior::Approve)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn authorize(
        &self,
        amount_minor_units: i64,
        _currency: &str,
        metadata: &AuthorizationMetadata,
    ) -> Result<Authorization, ServiceError> {
        match self.current_behavior() {
            MockBehavior::Approve => {}
            MockBehavior::Decline(reason) => return Err(ServiceError::GatewayError(reason)),
            MockBehavior::Delay(delay) => tokio::time::sleep(delay).await,
        }
        if amount_minor_units <= 0 {
            return Err(ServiceError::GatewayError(
                "amount must be positive".to_string(),
            ));
        }

        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let authorization_id = format!("pi_mock_{}", n);
        self.statuses
            .insert(authorization_id.clone(), AuthorizationStatus::Pending);
        self.authorizations
            .insert(authorization_id.clone(), metadata.clone());

        Ok(Authorization {
            client_secret: format!("{}_secret_{}", authorization_id, Uuid::new_v4().simple()),
            authorization_id,
        })
    }

    async fn retrieve_status(
        &self,
        authorization_id: &str,
    ) -> Result<AuthorizationStatus, ServiceError> {
        self.statuses
            .get(authorization_id)
            .map(|status| *status)
            .ok_or_else(|| {
                ServiceError::GatewayError(format!("no such authorization: {}", authorization_id))
            })
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

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn metadata() -> AuthorizationMetadata {
        AuthorizationMetadata {
            checkout_session_id: Uuid::new_v4(),
            buyer_id: "b1".into(),
            item_ids: vec!["p1".into()],
        }
    }

    #[tokio::test]
    async fn authorizations_are_sequential_and_pending() {
        let gateway = MockGateway::default();
        let first = gateway.authorize(499, "USD", &metadata()).await.unwrap();
        let second = gateway.authorize(499, "USD", &metadata()).await.unwrap();

        assert_eq!(first.authorization_id, "pi_mock_1");
        assert_eq!(second.authorization_id, "pi_mock_2");
        assert_eq!(
            gateway.retrieve_status("pi_mock_1").await.unwrap(),
            AuthorizationStatus::Pending
        );

        gateway.set_status("pi_mock_1", AuthorizationStatus::Succeeded);
        assert_eq!(
            gateway.retrieve_status("pi_mock_1").await.unwrap(),
            AuthorizationStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn scripted_decline_surfaces_gateway_error() {
        let gateway = MockGateway::default();
        gateway.set_behavior(MockBehavior::Decline("card_declined".into()));
        assert_matches!(
            gateway.authorize(499, "USD", &metadata()).await,
            Err(ServiceError::GatewayError(reason)) if reason == "card_declined"
        );
        assert_eq!(gateway.authorization_count(), 0);
    }

    #[test]
    fn signed_events_verify_and_forged_ones_do_not() {
        let gateway = MockGateway::default();
        let session_id = Uuid::new_v4();
        let (payload, header) = gateway
            .signed_event("evt_1", "payment_intent.succeeded", session_id)
            .unwrap();

        assert_matches!(
            gateway.verify_callback(&payload, &header),
            Ok(GatewayCallback::Payment(event)) if event.checkout_session_id == session_id
        );
        assert_matches!(
            gateway.verify_callback(&payload, "t=1,v1=00"),
            Err(ServiceError::SignatureError(_))
        );
    }
}
