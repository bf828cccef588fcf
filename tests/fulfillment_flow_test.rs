mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{item, TestApp};
use promptmarket_api::{
    entities::{
        checkout_session::CheckoutStatus,
        entitlement, order,
        payment_event::{self, PaymentEventStatus, PaymentOutcome},
        product_ledger, seller_ledger,
    },
    errors::{CartValidationError, ServiceError},
    events::Event,
    gateway::{mock::MockBehavior, AuthorizationStatus},
    models::{CartItem, CheckoutSession, PaymentEvent},
    services::{
        fulfillment::FinalizeResult,
        ledger::{
            ClaimOutcome, EventDisposition, InsertOutcome, LedgerStore, RefundOutcome,
            SeaOrmLedgerStore,
        },
        payout::FeePolicy,
    },
};
use sea_orm::EntityTrait;
use uuid::Uuid;

fn succeeded(event_id: &str, session_id: Uuid) -> PaymentEvent {
    PaymentEvent::new(event_id, session_id, PaymentOutcome::Succeeded)
}

fn failed(event_id: &str, session_id: Uuid) -> PaymentEvent {
    PaymentEvent::new(event_id, session_id, PaymentOutcome::Failed)
}

#[tokio::test]
async fn single_item_checkout_settles_exactly_once() {
    let app = TestApp::new().await;

    let created = app.checkout("b1", &[item("p1", 499, "s1")]).await;
    assert_eq!(created.session.status, CheckoutStatus::AwaitingPayment);
    assert_eq!(created.session.total_minor_units, 499);
    let session_id = created.session.id;

    let result = app.engine.finalize(succeeded("e1", session_id)).await.unwrap();
    assert_eq!(
        result,
        FinalizeResult::Settled {
            session_id,
            orders_created: 1
        }
    );
    assert_eq!(app.session_status(session_id).await, CheckoutStatus::Settled);

    let orders = app.ledger.orders_for_session(session_id).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].amount_minor_units, 499);
    assert_eq!(orders[0].buyer_id, "b1");
    assert_eq!(orders[0].product_id, "p1");
    assert_eq!(orders[0].seller_id, "s1");
    assert_eq!(orders[0].status, order::OrderStatus::Completed);
    assert!(app.ledger.has_entitlement("b1", "p1").await.unwrap());

    let seller = app.ledger.seller_ledger("s1").await.unwrap().unwrap();
    assert_eq!(seller.sales_count, 1);
    assert_eq!(seller.earnings_minor_units, 400);

    // redelivery of the same event
    let again = app.engine.finalize(succeeded("e1", session_id)).await.unwrap();
    assert_eq!(again, FinalizeResult::AlreadyProcessed);

    assert_eq!(app.ledger.orders_for_session(session_id).await.unwrap().len(), 1);
    let seller = app.ledger.seller_ledger("s1").await.unwrap().unwrap();
    assert_eq!(seller.sales_count, 1);
    assert_eq!(seller.earnings_minor_units, 400);
}

#[tokio::test]
async fn failed_outcome_produces_no_orders_or_entitlements() {
    let app = TestApp::new().await;
    let created = app
        .checkout("b1", &[item("p1", 499, "s1"), item("p2", 1000, "s2")])
        .await;
    let session_id = created.session.id;

    let result = app.engine.finalize(failed("e_fail", session_id)).await.unwrap();
    assert_eq!(result, FinalizeResult::Failed { session_id });
    assert_eq!(app.session_status(session_id).await, CheckoutStatus::Failed);

    assert!(app.ledger.orders_for_session(session_id).await.unwrap().is_empty());
    assert!(entitlement::Entity::find().all(&*app.db).await.unwrap().is_empty());
    assert!(seller_ledger::Entity::find().all(&*app.db).await.unwrap().is_empty());

    app.wait_for_event(|e| matches!(e, Event::CheckoutFailed { session_id: id, .. } if *id == session_id))
        .await;
}

#[tokio::test]
async fn success_after_a_declined_attempt_flags_a_refund() {
    let app = TestApp::new().await;
    let created = app.checkout("b1", &[item("p1", 499, "s1")]).await;
    let session_id = created.session.id;

    let first = app
        .engine
        .finalize(failed("evt_attempt_1", session_id))
        .await
        .unwrap();
    assert_eq!(first, FinalizeResult::Failed { session_id });

    // the buyer paid with another card on the same intent
    let second = app
        .engine
        .finalize(succeeded("evt_attempt_2", session_id))
        .await
        .unwrap();
    assert_eq!(
        second,
        FinalizeResult::Terminal {
            status: CheckoutStatus::Failed
        }
    );
    assert!(app.ledger.orders_for_session(session_id).await.unwrap().is_empty());
    assert!(!app.ledger.has_entitlement("b1", "p1").await.unwrap());

    let stored = payment_event::Entity::find_by_id("evt_attempt_2".to_string())
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PaymentEventStatus::Rejected);

    let flagged = app
        .wait_for_event(|e| matches!(e, Event::RefundRequired { session_id: id, .. } if *id == session_id))
        .await;
    assert_matches!(
        flagged,
        Event::RefundRequired { gateway_event_id, .. } if gateway_event_id == "evt_attempt_2"
    );
}

#[tokio::test]
async fn self_purchase_is_rejected_without_persisting_a_session() {
    let app = TestApp::new().await;

    let err = app
        .engine
        .create_checkout("s1", &[item("p1", 499, "s1")], None)
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::Validation(CartValidationError::SelfPurchase { ref buyer_id, .. }) if buyer_id == "s1"
    );
    assert!(promptmarket_api::entities::checkout_session::Entity::find()
        .all(&*app.db)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(app.gateway.authorization_count(), 0);
}

#[tokio::test]
async fn cart_validation_uses_current_catalog_state() {
    let app = TestApp::new().await;

    assert_matches!(
        app.engine.create_checkout("b1", &[], None).await,
        Err(ServiceError::Validation(CartValidationError::EmptyCart))
    );
    assert_matches!(
        app.engine
            .create_checkout("b1", &[item("p1", 499, "s1"), item("p1", 499, "s1")], None)
            .await,
        Err(ServiceError::Validation(CartValidationError::DuplicateItem { .. }))
    );
    assert_matches!(
        app.engine
            .create_checkout("b1", &[item("retired", 300, "s2")], None)
            .await,
        Err(ServiceError::Validation(CartValidationError::ProductUnavailable { .. }))
    );

    app.catalog.set_price("p1", 599);
    assert_matches!(
        app.engine
            .create_checkout("b1", &[item("p1", 499, "s1")], None)
            .await,
        Err(ServiceError::Validation(CartValidationError::PriceMismatch {
            submitted: 499,
            current: 599,
            ..
        }))
    );

    let created = app.checkout("b1", &[item("p1", 599, "s1")]).await;
    assert_eq!(created.session.total_minor_units, 599);
}

#[tokio::test]
async fn total_is_the_sum_of_catalog_prices_and_metadata_reaches_the_gateway() {
    let app = TestApp::new().await;
    let created = app
        .checkout(
            "b1",
            &[item("p2", 1000, "s2"), item("p1", 499, "s1"), item("p3", 250, "s1")],
        )
        .await;

    assert_eq!(created.session.total_minor_units, 1749);
    assert_eq!(created.session.currency, "USD");
    let authorization_id = created
        .session
        .gateway_authorization_id
        .clone()
        .expect("authorization id stored");
    assert!(created.client_secret.starts_with(&authorization_id));

    let metadata = app.gateway.metadata(&authorization_id).unwrap();
    assert_eq!(metadata.checkout_session_id, created.session.id);
    assert_eq!(metadata.buyer_id, "b1");
    assert_eq!(metadata.item_ids, vec!["p2", "p1", "p3"]);
}

#[tokio::test]
async fn concurrent_finalize_with_same_event_materializes_once() {
    let app = TestApp::new().await;
    let created = app
        .checkout("b1", &[item("p1", 499, "s1"), item("p2", 1000, "s2")])
        .await;
    let session_id = created.session.id;

    let first = {
        let engine = app.engine.clone();
        tokio::spawn(async move { engine.finalize(succeeded("e_race", session_id)).await })
    };
    let second = {
        let engine = app.engine.clone();
        tokio::spawn(async move { engine.finalize(succeeded("e_race", session_id)).await })
    };
    let (first, second) = tokio::join!(first, second);
    let results = [first.unwrap().unwrap(), second.unwrap().unwrap()];

    let settled = results
        .iter()
        .filter(|r| matches!(r, FinalizeResult::Settled { orders_created: 2, .. }))
        .count();
    let duplicates = results
        .iter()
        .filter(|r| **r == FinalizeResult::AlreadyProcessed)
        .count();
    assert_eq!((settled, duplicates), (1, 1));

    assert_eq!(app.ledger.orders_for_session(session_id).await.unwrap().len(), 2);
    assert_eq!(
        app.ledger.product_ledger("p2").await.unwrap().unwrap().sales_count,
        1
    );
}

#[tokio::test]
async fn different_event_ids_for_one_session_still_yield_one_order_per_item() {
    let app = TestApp::new().await;
    let created = app
        .checkout("b1", &[item("p1", 499, "s1"), item("p3", 250, "s1")])
        .await;
    let session_id = created.session.id;

    let (a, b) = tokio::join!(
        app.engine.finalize(succeeded("evt_webhook", session_id)),
        app.engine.finalize(succeeded("evt_duplicate_auth", session_id)),
    );
    let results = [a.unwrap(), b.unwrap()];
    assert!(results
        .iter()
        .any(|r| matches!(r, FinalizeResult::Settled { .. })));

    let orders = app.ledger.orders_for_session(session_id).await.unwrap();
    assert_eq!(orders.len(), 2);
    let seller = app.ledger.seller_ledger("s1").await.unwrap().unwrap();
    assert_eq!(seller.sales_count, 2);
    assert_eq!(seller.earnings_minor_units, 400 + 200);

    // a third delivery after settlement reports the terminal state
    let late = app
        .engine
        .finalize(succeeded("evt_third", session_id))
        .await
        .unwrap();
    assert_eq!(
        late,
        FinalizeResult::Terminal {
            status: CheckoutStatus::Settled
        }
    );
}

/// Delegates to a real store but fails materialization of one product
/// until told to recover
struct FlakyLedger {
    inner: SeaOrmLedgerStore,
    fail_product: Mutex<Option<String>>,
}

impl FlakyLedger {
    fn failing_on(inner: SeaOrmLedgerStore, product_id: &str) -> Self {
        Self {
            inner,
            fail_product: Mutex::new(Some(product_id.to_string())),
        }
    }

    fn recover(&self) {
        *self.fail_product.lock().unwrap() = None;
    }
}

#[async_trait]
impl LedgerStore for FlakyLedger {
    async fn claim_payment_event(
        &self,
        event: &PaymentEvent,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, ServiceError> {
        self.inner.claim_payment_event(event, lease, now).await
    }

    async fn complete_payment_event(
        &self,
        gateway_event_id: &str,
        disposition: EventDisposition,
    ) -> Result<(), ServiceError> {
        self.inner
            .complete_payment_event(gateway_event_id, disposition)
            .await
    }

    async fn release_payment_event(&self, gateway_event_id: &str) -> Result<(), ServiceError> {
        self.inner.release_payment_event(gateway_event_id).await
    }

    async fn insert_session(&self, session: &CheckoutSession) -> Result<(), ServiceError> {
        self.inner.insert_session(session).await
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Option<CheckoutSession>, ServiceError> {
        self.inner.load_session(session_id).await
    }

    async fn transition_session(
        &self,
        session_id: Uuid,
        from: &[CheckoutStatus],
        to: CheckoutStatus,
        authorization_id: Option<String>,
    ) -> Result<bool, ServiceError> {
        self.inner
            .transition_session(session_id, from, to, authorization_id)
            .await
    }

    async fn materialize_item(
        &self,
        session: &CheckoutSession,
        item: &CartItem,
        fees: &FeePolicy,
    ) -> Result<InsertOutcome, ServiceError> {
        let failing = self.fail_product.lock().unwrap().clone();
        if failing.as_deref() == Some(item.product_id.as_str()) {
            return Err(ServiceError::InternalError("store unavailable".into()));
        }
        self.inner.materialize_item(session, item, fees).await
    }

    async fn expire_sessions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        self.inner.expire_sessions(cutoff, now).await
    }

    async fn orders_for_session(&self, session_id: Uuid) -> Result<Vec<order::Model>, ServiceError> {
        self.inner.orders_for_session(session_id).await
    }

    async fn orders_for_buyer(&self, buyer_id: &str) -> Result<Vec<order::Model>, ServiceError> {
        self.inner.orders_for_buyer(buyer_id).await
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        self.inner.find_order(order_id).await
    }

    async fn has_entitlement(&self, buyer_id: &str, product_id: &str) -> Result<bool, ServiceError> {
        self.inner.has_entitlement(buyer_id, product_id).await
    }

    async fn seller_ledger(
        &self,
        seller_id: &str,
    ) -> Result<Option<seller_ledger::Model>, ServiceError> {
        self.inner.seller_ledger(seller_id).await
    }

    async fn product_ledger(
        &self,
        product_id: &str,
    ) -> Result<Option<product_ledger::Model>, ServiceError> {
        self.inner.product_ledger(product_id).await
    }

    async fn refund_order(&self, order_id: Uuid) -> Result<RefundOutcome, ServiceError> {
        self.inner.refund_order(order_id).await
    }
}

#[tokio::test]
async fn partial_failure_resumes_on_reinvocation() {
    let app = TestApp::new().await;
    let flaky = Arc::new(FlakyLedger::failing_on(
        SeaOrmLedgerStore::new(app.db.clone()),
        "p3",
    ));
    let engine = app.engine_with_ledger(flaky.clone());

    let created = engine
        .create_checkout(
            "b1",
            &[item("p1", 499, "s1"), item("p2", 1000, "s2"), item("p3", 250, "s1")],
            None,
        )
        .await
        .unwrap();
    let session_id = created.session.id;

    let err = engine
        .finalize(succeeded("e_partial", session_id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InternalError(_));
    assert_eq!(
        app.session_status(session_id).await,
        CheckoutStatus::AwaitingPayment
    );
    assert_eq!(app.ledger.orders_for_session(session_id).await.unwrap().len(), 2);

    flaky.recover();
    let result = engine.finalize(succeeded("e_partial", session_id)).await.unwrap();
    assert_eq!(
        result,
        FinalizeResult::Settled {
            session_id,
            orders_created: 1
        }
    );

    assert_eq!(app.ledger.orders_for_session(session_id).await.unwrap().len(), 3);
    let seller = app.ledger.seller_ledger("s1").await.unwrap().unwrap();
    assert_eq!(seller.sales_count, 2);
    assert_eq!(
        app.ledger.product_ledger("p1").await.unwrap().unwrap().sales_count,
        1
    );

    assert_eq!(
        engine.finalize(succeeded("e_partial", session_id)).await.unwrap(),
        FinalizeResult::AlreadyProcessed
    );
}

#[tokio::test]
async fn expiry_sweep_spares_a_partially_settled_session() {
    let app = TestApp::new().await;
    let flaky = Arc::new(FlakyLedger::failing_on(
        SeaOrmLedgerStore::new(app.db.clone()),
        "p2",
    ));
    let engine = app.engine_with_ledger(flaky.clone());

    let created = engine
        .create_checkout("b1", &[item("p1", 499, "s1"), item("p2", 1000, "s2")], None)
        .await
        .unwrap();
    let session_id = created.session.id;

    assert!(engine.finalize(succeeded("e_paid", session_id)).await.is_err());
    assert_eq!(app.ledger.orders_for_session(session_id).await.unwrap().len(), 1);

    // the claim was released and one order exists; the sweep must leave it open
    let expired = engine
        .expire_stale_sessions(Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(expired, 0);
    assert_eq!(
        app.session_status(session_id).await,
        CheckoutStatus::AwaitingPayment
    );

    flaky.recover();
    let result = engine.finalize(succeeded("e_paid", session_id)).await.unwrap();
    assert_eq!(
        result,
        FinalizeResult::Settled {
            session_id,
            orders_created: 1
        }
    );
    assert_eq!(app.ledger.orders_for_session(session_id).await.unwrap().len(), 2);
    assert!(app.ledger.has_entitlement("b1", "p2").await.unwrap());
    assert!(!app
        .recorder
        .events()
        .iter()
        .any(|e| matches!(e, Event::RefundRequired { .. })));
}

#[tokio::test]
async fn gateway_decline_fails_the_session() {
    let app = TestApp::new().await;
    app.gateway
        .set_behavior(MockBehavior::Decline("card_declined".into()));

    let err = app
        .engine
        .create_checkout("b1", &[item("p1", 499, "s1")], None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::GatewayError(ref reason) if reason == "card_declined");

    let sessions = promptmarket_api::entities::checkout_session::Entity::find()
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, CheckoutStatus::Failed);
}

#[tokio::test]
async fn gateway_timeout_leaves_session_created_and_retry_succeeds() {
    let app = TestApp::new().await;
    app.gateway
        .set_behavior(MockBehavior::Delay(Duration::from_secs(2)));

    let err = app
        .engine
        .create_checkout("b1", &[item("p1", 499, "s1")], None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::GatewayTimeout);
    assert!(err.is_retryable());

    let sessions = promptmarket_api::entities::checkout_session::Entity::find()
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, CheckoutStatus::Created);

    app.gateway.set_behavior(MockBehavior::Approve);
    let retried = app.checkout("b1", &[item("p1", 499, "s1")]).await;
    assert_eq!(retried.session.status, CheckoutStatus::AwaitingPayment);
}

#[tokio::test]
async fn late_success_for_expired_session_is_rejected_and_flags_refund() {
    let app = TestApp::new().await;
    let created = app.checkout("b1", &[item("p1", 499, "s1")]).await;
    let session_id = created.session.id;

    let expired = app
        .engine
        .expire_stale_sessions(Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(expired, 1);
    assert_eq!(app.session_status(session_id).await, CheckoutStatus::Expired);

    let err = app
        .engine
        .finalize(succeeded("e_late", session_id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::SessionExpired(id) if id == session_id);
    assert!(app.ledger.orders_for_session(session_id).await.unwrap().is_empty());
    assert!(!app.ledger.has_entitlement("b1", "p1").await.unwrap());

    app.wait_for_event(|e| matches!(e, Event::RefundRequired { session_id: id, .. } if *id == session_id))
        .await;

    // the rejected event is not processed again
    assert_eq!(
        app.engine.finalize(succeeded("e_late", session_id)).await.unwrap(),
        FinalizeResult::AlreadyProcessed
    );
    // a late failure is simply ignored
    assert_eq!(
        app.engine.finalize(failed("e_late_fail", session_id)).await.unwrap(),
        FinalizeResult::Terminal {
            status: CheckoutStatus::Expired
        }
    );
}

#[tokio::test]
async fn unknown_session_is_fatal_for_the_event() {
    let app = TestApp::new().await;
    let err = app
        .engine
        .finalize(succeeded("e_orphan", Uuid::new_v4()))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::UnknownSession(_));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn confirm_path_converges_with_the_webhook_path() {
    let app = TestApp::new().await;
    let created = app.checkout("b1", &[item("p1", 499, "s1")]).await;
    let session_id = created.session.id;
    let authorization_id = created.session.gateway_authorization_id.clone().unwrap();

    // still pending at the gateway
    let pending = app.engine.confirm_checkout(session_id, "b1").await.unwrap();
    assert!(pending.result.is_none());
    assert_eq!(pending.session.status, CheckoutStatus::AwaitingPayment);

    app.gateway
        .set_status(&authorization_id, AuthorizationStatus::Succeeded);
    let confirmed = app.engine.confirm_checkout(session_id, "b1").await.unwrap();
    assert_matches!(confirmed.result, Some(FinalizeResult::Settled { orders_created: 1, .. }));
    assert_eq!(confirmed.session.status, CheckoutStatus::Settled);

    // the webhook for the same payment arrives afterwards
    let webhook = app
        .engine
        .finalize(succeeded("evt_webhook", session_id))
        .await
        .unwrap();
    assert_eq!(
        webhook,
        FinalizeResult::Terminal {
            status: CheckoutStatus::Settled
        }
    );
    assert_eq!(app.ledger.orders_for_session(session_id).await.unwrap().len(), 1);

    // another buyer cannot confirm it
    assert_matches!(
        app.engine.confirm_checkout(session_id, "b2").await,
        Err(ServiceError::UnknownSession(_))
    );
}

#[tokio::test]
async fn expiry_sweep_leaves_recent_and_terminal_sessions_alone() {
    let app = TestApp::new().await;
    let open = app.checkout("b1", &[item("p1", 499, "s1")]).await;
    let settled = app.checkout("b2", &[item("p1", 499, "s1")]).await;
    app.engine
        .finalize(succeeded("e_settle", settled.session.id))
        .await
        .unwrap();

    assert_eq!(app.engine.expire_stale_sessions(Utc::now()).await.unwrap(), 0);

    let later = Utc::now() + chrono::Duration::hours(2);
    assert_eq!(app.engine.expire_stale_sessions(later).await.unwrap(), 1);
    assert_eq!(app.session_status(open.session.id).await, CheckoutStatus::Expired);
    assert_eq!(
        app.session_status(settled.session.id).await,
        CheckoutStatus::Settled
    );

    app.wait_for_event(|e| matches!(e, Event::CheckoutsExpired { count: 1, .. }))
        .await;
}

#[tokio::test]
async fn refund_reverses_counters_and_keeps_access() {
    let app = TestApp::new().await;
    let created = app.checkout("b1", &[item("p2", 1000, "s2")]).await;
    app.engine
        .finalize(succeeded("e_refund", created.session.id))
        .await
        .unwrap();
    let order = app.ledger.orders_for_buyer("b1").await.unwrap().remove(0);

    assert_matches!(
        app.engine.refund_order(order.id).await.unwrap(),
        RefundOutcome::Refunded(_)
    );
    assert_matches!(
        app.engine.refund_order(order.id).await.unwrap(),
        RefundOutcome::AlreadyRefunded(_)
    );

    let seller = app.ledger.seller_ledger("s2").await.unwrap().unwrap();
    assert_eq!((seller.sales_count, seller.earnings_minor_units), (0, 0));
    let product = app.ledger.product_ledger("p2").await.unwrap().unwrap();
    assert_eq!((product.sales_count, product.revenue_minor_units), (0, 0));
    assert!(app.ledger.has_entitlement("b1", "p2").await.unwrap());

    app.wait_for_event(|e| matches!(e, Event::OrderRefunded { order_id, .. } if *order_id == order.id))
        .await;
}
