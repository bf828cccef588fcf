use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::timeout};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::{checkout_session::CheckoutStatus, payment_event::PaymentOutcome},
    errors::{CartValidationError, ServiceError},
    events::{Event, EventSender},
    gateway::{AuthorizationMetadata, AuthorizationStatus, PaymentGateway},
    middleware_helpers::retry::{with_retry, RetryConfig, ServiceRetryPolicy},
    models::{CartItem, CheckoutSession, PaymentEvent},
    services::{
        cart::validate_cart_shape,
        catalog::CatalogReader,
        ledger::{ClaimOutcome, EventDisposition, InsertOutcome, LedgerStore, RefundOutcome},
        payout::FeePolicy,
    },
};

/// Timeouts, retry and payout settings for the engine
#[derive(Debug, Clone)]
pub struct FulfillmentSettings {
    pub default_currency: String,
    pub catalog_timeout: Duration,
    pub gateway_timeout: Duration,
    pub ledger_timeout: Duration,
    pub finalize_lease: Duration,
    pub checkout_expiry: Duration,
    pub retry: RetryConfig,
    pub fee_policy: FeePolicy,
}

impl Default for FulfillmentSettings {
    fn default() -> Self {
        Self {
            default_currency: "USD".to_string(),
            catalog_timeout: Duration::from_secs(2),
            gateway_timeout: Duration::from_secs(10),
            ledger_timeout: Duration::from_secs(5),
            finalize_lease: Duration::from_secs(60),
            checkout_expiry: Duration::from_secs(3600),
            retry: RetryConfig::default(),
            fee_policy: FeePolicy::default(),
        }
    }
}

impl From<&AppConfig> for FulfillmentSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            default_currency: config.default_currency.clone(),
            catalog_timeout: config.catalog_timeout(),
            gateway_timeout: config.gateway_timeout(),
            ledger_timeout: config.ledger_timeout(),
            finalize_lease: config.finalize_lease(),
            checkout_expiry: config.checkout_expiry(),
            retry: RetryConfig::default().with_max_attempts(config.finalize_max_attempts),
            fee_policy: config.fee_policy(),
        }
    }
}

/// A freshly authorized checkout and the secret the client pays with
#[derive(Debug, Clone, Serialize)]
pub struct CreatedCheckout {
    pub session: CheckoutSession,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FinalizeResult {
    Settled {
        session_id: Uuid,
        orders_created: usize,
    },
    Failed {
        session_id: Uuid,
    },
    /// The event was already claimed by another invocation
    AlreadyProcessed,
    /// The session had already reached this terminal status
    Terminal { status: CheckoutStatus },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmOutcome {
    /// `None` while the gateway still reports the payment as pending
    pub result: Option<FinalizeResult>,
    pub session: CheckoutSession,
}

/// Turns carts into checkouts and confirmed payments into orders,
/// entitlements and seller payouts, exactly once per payment.
#[derive(Clone)]
pub struct FulfillmentEngine {
    ledger: Arc<dyn LedgerStore>,
    catalog: Arc<dyn CatalogReader>,
    gateway: Arc<dyn PaymentGateway>,
    events: Option<EventSender>,
    settings: FulfillmentSettings,
}

fn normalize_currency(currency: &str) -> Result<String, CartValidationError> {
    let upper = currency.trim().to_ascii_uppercase();
    if upper.len() == 3 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(upper)
    } else {
        Err(CartValidationError::InvalidCurrency {
            currency: currency.to_string(),
        })
    }
}

impl FulfillmentEngine {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        catalog: Arc<dyn CatalogReader>,
        gateway: Arc<dyn PaymentGateway>,
        settings: FulfillmentSettings,
    ) -> Self {
        Self {
            ledger,
            catalog,
            gateway,
            events: None,
            settings,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    pub fn settings(&self) -> &FulfillmentSettings {
        &self.settings
    }

    async fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            events.publish(event).await;
        }
    }

    /// Runs a store operation under the ledger timeout
    async fn within_ledger<T, F>(&self, operation: &str, future: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        match timeout(self.settings.ledger_timeout, future).await {
            Ok(result) => result,
            Err(_) => {
                counter!("promptmarket_fulfillment.ledger_timeouts", 1, "operation" => operation.to_string());
                Err(ServiceError::LedgerTimeout(operation.to_string()))
            }
        }
    }

    /// Checks every line against the catalog and returns the lines priced
    /// and attributed as the catalog has them
    async fn price_cart(
        &self,
        buyer_id: &str,
        items: &[CartItem],
        currency: &str,
    ) -> Result<Vec<CartItem>, ServiceError> {
        let mut priced = Vec::with_capacity(items.len());

        for item in items {
            let product = timeout(
                self.settings.catalog_timeout,
                self.catalog.get_product(&item.product_id),
            )
            .await
            .map_err(|_| ServiceError::ServiceUnavailable("catalog lookup timed out".into()))??
            .ok_or_else(|| CartValidationError::UnknownProduct {
                product_id: item.product_id.clone(),
            })?;

            if product.seller_id == buyer_id || item.seller_id == buyer_id {
                return Err(CartValidationError::SelfPurchase {
                    buyer_id: buyer_id.to_string(),
                    product_id: item.product_id.clone(),
                }
                .into());
            }
            if !product.available {
                return Err(CartValidationError::ProductUnavailable {
                    product_id: item.product_id.clone(),
                }
                .into());
            }
            if product.price_minor_units != item.unit_price_minor_units {
                return Err(CartValidationError::PriceMismatch {
                    product_id: item.product_id.clone(),
                    submitted: item.unit_price_minor_units,
                    current: product.price_minor_units,
                }
                .into());
            }
            if !product.currency.eq_ignore_ascii_case(currency) {
                return Err(CartValidationError::InvalidCurrency {
                    currency: currency.to_string(),
                }
                .into());
            }

            priced.push(CartItem {
                product_id: product.product_id,
                unit_price_minor_units: product.price_minor_units,
                seller_id: product.seller_id,
            });
        }

        Ok(priced)
    }

    /// Validates the cart, persists a session and requests a payment
    /// authorization for its total.
    ///
    /// Validation failures persist nothing. A gateway timeout leaves the
    /// session in `created`; any other gateway failure marks it `failed`.
    #[instrument(skip(self, items), fields(item_count = items.len()))]
    pub async fn create_checkout(
        &self,
        buyer_id: &str,
        items: &[CartItem],
        currency: Option<&str>,
    ) -> Result<CreatedCheckout, ServiceError> {
        let buyer_id = buyer_id.trim();
        if buyer_id.is_empty() {
            return Err(CartValidationError::MissingBuyer.into());
        }
        validate_cart_shape(items)?;
        let currency =
            normalize_currency(currency.unwrap_or(self.settings.default_currency.as_str()))?;

        let priced = self.price_cart(buyer_id, items, &currency).await?;
        let mut session = CheckoutSession::open(buyer_id, priced, currency);
        self.within_ledger("insert_session", self.ledger.insert_session(&session))
            .await?;
        info!(session_id = %session.id, total = session.total_minor_units, "Checkout session created");

        let metadata = AuthorizationMetadata {
            checkout_session_id: session.id,
            buyer_id: session.buyer_id.clone(),
            item_ids: session.items.iter().map(|i| i.product_id.clone()).collect(),
        };
        let authorization = match timeout(
            self.settings.gateway_timeout,
            self.gateway
                .authorize(session.total_minor_units, &session.currency, &metadata),
        )
        .await
        {
            Ok(Ok(authorization)) => authorization,
            Ok(Err(ServiceError::GatewayTimeout)) | Err(_) => {
                warn!(session_id = %session.id, "Payment authorization timed out; session left in created");
                counter!("promptmarket_fulfillment.gateway_timeouts", 1);
                return Err(ServiceError::GatewayTimeout);
            }
            Ok(Err(err)) => {
                warn!(session_id = %session.id, error = %err, "Payment authorization failed");
                self.within_ledger(
                    "transition_session",
                    self.ledger.transition_session(
                        session.id,
                        &[CheckoutStatus::Created],
                        CheckoutStatus::Failed,
                        None,
                    ),
                )
                .await?;
                self.publish(Event::CheckoutFailed {
                    session_id: session.id,
                    reason: err.to_string(),
                })
                .await;
                return Err(match err {
                    ServiceError::GatewayError(message) => ServiceError::GatewayError(message),
                    other => ServiceError::GatewayError(other.to_string()),
                });
            }
        };

        let moved = self
            .within_ledger(
                "transition_session",
                self.ledger.transition_session(
                    session.id,
                    &[CheckoutStatus::Created],
                    CheckoutStatus::AwaitingPayment,
                    Some(authorization.authorization_id.clone()),
                ),
            )
            .await?;
        if !moved {
            return Err(ServiceError::Conflict(format!(
                "checkout session {} changed while authorizing",
                session.id
            )));
        }

        session.status = CheckoutStatus::AwaitingPayment;
        session.gateway_authorization_id = Some(authorization.authorization_id);
        session.updated_at = Utc::now();

        counter!("promptmarket_fulfillment.checkouts_created", 1, "gateway" => self.gateway.name());
        self.publish(Event::CheckoutCreated {
            session_id: session.id,
            buyer_id: session.buyer_id.clone(),
            total_minor_units: session.total_minor_units,
            currency: session.currency.clone(),
        })
        .await;

        Ok(CreatedCheckout {
            session,
            client_secret: authorization.client_secret,
        })
    }

    /// Applies a payment outcome at most once.
    ///
    /// The event is claimed first; a concurrent or repeated delivery of the
    /// same event gets `AlreadyProcessed`. Transient failures release the
    /// claim and return the error so the caller can retry; already
    /// materialized lines are skipped on the next attempt.
    #[instrument(skip(self, event), fields(gateway_event_id = %event.gateway_event_id, session_id = %event.checkout_session_id, outcome = %event.outcome))]
    pub async fn finalize(&self, event: PaymentEvent) -> Result<FinalizeResult, ServiceError> {
        let start = std::time::Instant::now();

        let claim = self
            .within_ledger(
                "claim_payment_event",
                self.ledger.claim_payment_event(
                    &event,
                    self.settings.finalize_lease,
                    Utc::now(),
                ),
            )
            .await?;
        if claim == ClaimOutcome::AlreadyProcessed {
            info!("Payment event already processed");
            counter!("promptmarket_fulfillment.duplicate_events", 1);
            return Ok(FinalizeResult::AlreadyProcessed);
        }

        let applied = self.apply_claimed(&event).await;
        let id = event.gateway_event_id.as_str();

        let result = match applied {
            Ok((result, disposition)) => {
                if let Err(e) = self
                    .within_ledger(
                        "complete_payment_event",
                        self.ledger.complete_payment_event(id, disposition),
                    )
                    .await
                {
                    error!(error = %e, "Could not mark payment event complete; lease will lapse");
                }
                Ok(result)
            }
            Err(err @ (ServiceError::UnknownSession(_) | ServiceError::SessionExpired(_))) => {
                if let Err(e) = self
                    .within_ledger(
                        "complete_payment_event",
                        self.ledger
                            .complete_payment_event(id, EventDisposition::Rejected),
                    )
                    .await
                {
                    error!(error = %e, "Could not mark payment event rejected");
                }
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, "Finalize failed; releasing payment event for retry");
                if let Err(e) = self
                    .within_ledger(
                        "release_payment_event",
                        self.ledger.release_payment_event(id),
                    )
                    .await
                {
                    error!(error = %e, "Could not release payment event; lease will lapse");
                }
                Err(err)
            }
        };

        histogram!("promptmarket_fulfillment.finalize_duration", start.elapsed());
        result
    }

    async fn apply_claimed(
        &self,
        event: &PaymentEvent,
    ) -> Result<(FinalizeResult, EventDisposition), ServiceError> {
        let session_id = event.checkout_session_id;
        let Some(session) = self
            .within_ledger("load_session", self.ledger.load_session(session_id))
            .await?
        else {
            error!(%session_id, "Payment event for unknown checkout session; needs reconciliation");
            counter!("promptmarket_fulfillment.reconciliation_required", 1, "reason" => "unknown_session");
            return Err(ServiceError::UnknownSession(session_id));
        };

        match (session.status, event.outcome) {
            (CheckoutStatus::Failed, PaymentOutcome::Succeeded) => {
                error!(%session_id, "Payment succeeded after checkout failed; refund required");
                counter!("promptmarket_fulfillment.reconciliation_required", 1, "reason" => "session_failed");
                self.publish(Event::RefundRequired {
                    session_id,
                    gateway_event_id: event.gateway_event_id.clone(),
                    authorization_id: session.gateway_authorization_id.clone(),
                })
                .await;
                return Ok((
                    FinalizeResult::Terminal {
                        status: CheckoutStatus::Failed,
                    },
                    EventDisposition::Rejected,
                ));
            }
            (CheckoutStatus::Settled | CheckoutStatus::Failed, _) => {
                info!(status = %session.status, "Checkout session already terminal");
                return Ok((
                    FinalizeResult::Terminal {
                        status: session.status,
                    },
                    EventDisposition::Ignored,
                ));
            }
            (CheckoutStatus::Expired, PaymentOutcome::Succeeded) => {
                error!(%session_id, "Payment succeeded after checkout expired; refund required");
                counter!("promptmarket_fulfillment.reconciliation_required", 1, "reason" => "session_expired");
                self.publish(Event::RefundRequired {
                    session_id,
                    gateway_event_id: event.gateway_event_id.clone(),
                    authorization_id: session.gateway_authorization_id.clone(),
                })
                .await;
                return Err(ServiceError::SessionExpired(session_id));
            }
            (CheckoutStatus::Expired, PaymentOutcome::Failed) => {
                return Ok((
                    FinalizeResult::Terminal {
                        status: CheckoutStatus::Expired,
                    },
                    EventDisposition::Ignored,
                ));
            }
            (CheckoutStatus::Created | CheckoutStatus::AwaitingPayment, _) => {}
        }

        match event.outcome {
            PaymentOutcome::Failed => self.fail_session(&session).await,
            PaymentOutcome::Succeeded => self.settle_session(&session).await,
        }
    }

    async fn current_status(&self, session_id: Uuid) -> Result<CheckoutStatus, ServiceError> {
        self.within_ledger("load_session", self.ledger.load_session(session_id))
            .await?
            .map(|session| session.status)
            .ok_or(ServiceError::UnknownSession(session_id))
    }

    async fn fail_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<(FinalizeResult, EventDisposition), ServiceError> {
        let moved = self
            .within_ledger(
                "transition_session",
                self.ledger.transition_session(
                    session.id,
                    &CheckoutStatus::OPEN,
                    CheckoutStatus::Failed,
                    None,
                ),
            )
            .await?;
        if !moved {
            let status = self.current_status(session.id).await?;
            return Ok((FinalizeResult::Terminal { status }, EventDisposition::Ignored));
        }

        self.publish(Event::CheckoutFailed {
            session_id: session.id,
            reason: "payment failed".into(),
        })
        .await;
        Ok((
            FinalizeResult::Failed {
                session_id: session.id,
            },
            EventDisposition::Applied,
        ))
    }

    async fn settle_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<(FinalizeResult, EventDisposition), ServiceError> {
        let mut orders_created = 0;

        for item in &session.items {
            let outcome = with_retry(&self.settings.retry, ServiceRetryPolicy, move || {
                self.within_ledger(
                    "materialize_item",
                    self.ledger
                        .materialize_item(session, item, &self.settings.fee_policy),
                )
            })
            .await?;
            if outcome == InsertOutcome::Inserted {
                orders_created += 1;
            }
        }

        let settled = self
            .within_ledger(
                "transition_session",
                self.ledger.transition_session(
                    session.id,
                    &CheckoutStatus::OPEN,
                    CheckoutStatus::Settled,
                    None,
                ),
            )
            .await?;
        if !settled {
            let status = self.current_status(session.id).await?;
            if status != CheckoutStatus::Settled {
                error!(session_id = %session.id, %status, "Orders materialized but session moved elsewhere; needs reconciliation");
            }
            return Ok((FinalizeResult::Terminal { status }, EventDisposition::Ignored));
        }

        info!(session_id = %session.id, orders_created, "Checkout settled");
        self.publish(Event::CheckoutSettled {
            session_id: session.id,
            buyer_id: session.buyer_id.clone(),
            orders_created,
        })
        .await;
        Ok((
            FinalizeResult::Settled {
                session_id: session.id,
                orders_created,
            },
            EventDisposition::Applied,
        ))
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        self.within_ledger("load_session", self.ledger.load_session(session_id))
            .await?
            .ok_or(ServiceError::UnknownSession(session_id))
    }

    /// Synchronous confirmation after the client completed payment.
    ///
    /// Asks the gateway for the authorization status and finalizes with the
    /// authorization id as the event id, so it converges with the webhook.
    #[instrument(skip(self))]
    pub async fn confirm_checkout(
        &self,
        session_id: Uuid,
        buyer_id: &str,
    ) -> Result<ConfirmOutcome, ServiceError> {
        let session = self.get_session(session_id).await?;
        if session.buyer_id != buyer_id {
            return Err(ServiceError::UnknownSession(session_id));
        }
        match session.status {
            CheckoutStatus::Expired => return Err(ServiceError::SessionExpired(session_id)),
            CheckoutStatus::Settled | CheckoutStatus::Failed => {
                return Ok(ConfirmOutcome {
                    result: Some(FinalizeResult::Terminal {
                        status: session.status,
                    }),
                    session,
                })
            }
            CheckoutStatus::Created | CheckoutStatus::AwaitingPayment => {}
        }

        let Some(authorization_id) = session.gateway_authorization_id.clone() else {
            return Err(ServiceError::Conflict(
                "checkout has no payment authorization yet".into(),
            ));
        };

        let status = timeout(
            self.settings.gateway_timeout,
            self.gateway.retrieve_status(&authorization_id),
        )
        .await
        .map_err(|_| ServiceError::GatewayTimeout)??;

        let outcome = match status {
            AuthorizationStatus::Pending => {
                return Ok(ConfirmOutcome {
                    result: None,
                    session,
                })
            }
            AuthorizationStatus::Succeeded => PaymentOutcome::Succeeded,
            AuthorizationStatus::Failed => PaymentOutcome::Failed,
        };

        let result = self
            .finalize(PaymentEvent::new(authorization_id, session_id, outcome))
            .await?;
        let session = self.get_session(session_id).await?;
        Ok(ConfirmOutcome {
            result: Some(result),
            session,
        })
    }

    /// Expires open sessions older than the configured expiry
    #[instrument(skip(self))]
    pub async fn expire_stale_sessions(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let expiry = chrono::Duration::from_std(self.settings.checkout_expiry)
            .map_err(|e| ServiceError::InternalError(format!("checkout expiry out of range: {}", e)))?;
        let cutoff = now - expiry;

        let count = self
            .within_ledger("expire_sessions", self.ledger.expire_sessions(cutoff, now))
            .await?;
        if count > 0 {
            info!(count, %cutoff, "Expired stale checkout sessions");
            counter!("promptmarket_fulfillment.sessions_expired", count);
            self.publish(Event::CheckoutsExpired { count, cutoff }).await;
        }
        Ok(count)
    }

    #[instrument(skip(self))]
    pub async fn refund_order(&self, order_id: Uuid) -> Result<RefundOutcome, ServiceError> {
        let outcome = self
            .within_ledger("refund_order", self.ledger.refund_order(order_id))
            .await?;
        if let RefundOutcome::Refunded(order) = &outcome {
            self.publish(Event::OrderRefunded {
                order_id: order.id,
                seller_id: order.seller_id.clone(),
                amount_minor_units: order.amount_minor_units,
            })
            .await;
        }
        Ok(outcome)
    }
}

/// Periodically expires stale checkout sessions until the task is aborted
pub fn start_expiry_worker(engine: FulfillmentEngine, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(?interval, "Checkout expiry sweeper started");
        loop {
            ticker.tick().await;
            if let Err(e) = engine.expire_stale_sessions(Utc::now()).await {
                warn!(error = %e, "Checkout expiry sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use crate::entities::checkout_session;
    use crate::gateway::{Authorization, MockPaymentGateway};
    use crate::services::catalog::{CatalogProduct, InMemoryCatalog};
    use crate::services::ledger::SeaOrmLedgerStore;
    use assert_matches::assert_matches;
    use sea_orm::{DatabaseConnection, EntityTrait};

    async fn setup(gateway: MockPaymentGateway) -> (FulfillmentEngine, Arc<DatabaseConnection>) {
        let db = establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .unwrap();
        run_migrations(&db).await.unwrap();
        let db = Arc::new(db);
        let catalog = InMemoryCatalog::with_products([
            CatalogProduct::new("p1", "s1", 499, "USD"),
            CatalogProduct::new("p2", "s2", 1000, "USD"),
        ]);
        let engine = FulfillmentEngine::new(
            Arc::new(SeaOrmLedgerStore::new(db.clone())),
            Arc::new(catalog),
            Arc::new(gateway),
            FulfillmentSettings::default(),
        );
        (engine, db)
    }

    async fn only_session(db: &DatabaseConnection) -> checkout_session::Model {
        let mut sessions = checkout_session::Entity::find().all(db).await.unwrap();
        assert_eq!(sessions.len(), 1);
        sessions.remove(0)
    }

    #[tokio::test]
    async fn authorization_moves_session_to_awaiting_payment() {
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_name().return_const("mock");
        gateway
            .expect_authorize()
            .withf(|amount, currency, metadata| {
                *amount == 1499 && currency.to_string() == "USD" && metadata.item_ids == ["p1", "p2"]
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(Authorization {
                    authorization_id: "pi_1".into(),
                    client_secret: "pi_1_secret".into(),
                })
            });
        let (engine, db) = setup(gateway).await;

        let created = engine
            .create_checkout(
                "b1",
                &[CartItem::new("p1", 499, "s1"), CartItem::new("p2", 1000, "s2")],
                None,
            )
            .await
            .unwrap();

        assert_eq!(created.client_secret, "pi_1_secret");
        assert_eq!(created.session.total_minor_units, 1499);
        let stored = only_session(&db).await;
        assert_eq!(stored.status, CheckoutStatus::AwaitingPayment);
        assert_eq!(stored.gateway_authorization_id.as_deref(), Some("pi_1"));
    }

    #[tokio::test]
    async fn gateway_error_marks_session_failed() {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_authorize()
            .returning(|_, _, _| Err(ServiceError::GatewayError("card_declined".into())));
        let (engine, db) = setup(gateway).await;

        let err = engine
            .create_checkout("b1", &[CartItem::new("p1", 499, "s1")], None)
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::GatewayError(_));
        assert_eq!(only_session(&db).await.status, CheckoutStatus::Failed);
    }

    #[tokio::test]
    async fn gateway_timeout_leaves_session_created() {
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_authorize()
            .returning(|_, _, _| Err(ServiceError::GatewayTimeout));
        let (engine, db) = setup(gateway).await;

        let err = engine
            .create_checkout("b1", &[CartItem::new("p1", 499, "s1")], None)
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::GatewayTimeout);
        let stored = only_session(&db).await;
        assert_eq!(stored.status, CheckoutStatus::Created);
        assert!(stored.gateway_authorization_id.is_none());
    }

    #[tokio::test]
    async fn validation_failures_never_reach_the_gateway() {
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_authorize().never();
        let (engine, db) = setup(gateway).await;

        assert_matches!(
            engine.create_checkout("b1", &[], None).await,
            Err(ServiceError::Validation(CartValidationError::EmptyCart))
        );
        assert_matches!(
            engine
                .create_checkout("s1", &[CartItem::new("p1", 499, "s1")], None)
                .await,
            Err(ServiceError::Validation(CartValidationError::SelfPurchase { .. }))
        );
        assert_matches!(
            engine
                .create_checkout("b1", &[CartItem::new("p1", 399, "s1")], None)
                .await,
            Err(ServiceError::Validation(CartValidationError::PriceMismatch { current: 499, .. }))
        );
        assert_matches!(
            engine
                .create_checkout("b1", &[CartItem::new("nope", 1, "s1")], None)
                .await,
            Err(ServiceError::Validation(CartValidationError::UnknownProduct { .. }))
        );
        assert_matches!(
            engine
                .create_checkout("b1", &[CartItem::new("p1", 499, "s1")], Some("EUR"))
                .await,
            Err(ServiceError::Validation(CartValidationError::InvalidCurrency { .. }))
        );
        assert_matches!(
            engine
                .create_checkout("  ", &[CartItem::new("p1", 499, "s1")], None)
                .await,
            Err(ServiceError::Validation(CartValidationError::MissingBuyer))
        );

        assert!(checkout_session::Entity::find()
            .all(&*db)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_rejected_and_not_retried() {
        let (engine, _db) = setup(MockPaymentGateway::new()).await;
        let event = PaymentEvent::new("evt_x", Uuid::new_v4(), PaymentOutcome::Succeeded);

        assert_matches!(
            engine.finalize(event.clone()).await,
            Err(ServiceError::UnknownSession(_))
        );
        // the rejected event stays consumed
        assert_eq!(
            engine.finalize(event).await.unwrap(),
            FinalizeResult::AlreadyProcessed
        );
    }

    #[test]
    fn currency_codes_are_normalized() {
        assert_eq!(normalize_currency("usd").unwrap(), "USD");
        assert!(normalize_currency("US").is_err());
        assert!(normalize_currency("U$D").is_err());
    }
}
