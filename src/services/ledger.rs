use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::{Expr, OnConflict, Query},
    ActiveValue::Set,
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, TransactionTrait,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        checkout_session::{self, CheckoutStatus},
        checkout_session_item, entitlement,
        order::{self, OrderStatus},
        payment_event::{self, PaymentEventStatus, PaymentOutcome},
        product_ledger, seller_ledger,
    },
    errors::ServiceError,
    models::{CartItem, CheckoutSession, PaymentEvent},
    services::payout::FeePolicy,
};

/// Result of trying to take ownership of a payment event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyProcessed,
}

/// Result of an insert-if-absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExisted,
}

/// How a claimed payment event finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// The event changed the session
    Applied,
    /// The session was already terminal; nothing to do
    Ignored,
    /// The event cannot be applied and needs manual reconciliation
    Rejected,
}

impl From<EventDisposition> for PaymentEventStatus {
    fn from(disposition: EventDisposition) -> Self {
        match disposition {
            EventDisposition::Applied => PaymentEventStatus::Applied,
            EventDisposition::Ignored => PaymentEventStatus::Ignored,
            EventDisposition::Rejected => PaymentEventStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded(order::Model),
    AlreadyRefunded(order::Model),
}

/// Signed change to the seller and product counters of one order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub sales: i64,
    pub seller_earnings_minor_units: i64,
    pub revenue_minor_units: i64,
}

impl CounterDelta {
    pub fn sale(amount_minor_units: i64, seller_earnings_minor_units: i64) -> Self {
        Self {
            sales: 1,
            seller_earnings_minor_units,
            revenue_minor_units: amount_minor_units,
        }
    }

    pub fn reversal(order: &order::Model) -> Self {
        Self {
            sales: -1,
            seller_earnings_minor_units: -order.seller_earnings_minor_units,
            revenue_minor_units: -order.amount_minor_units,
        }
    }
}

/// Durable store behind checkout and fulfillment.
///
/// Every write that must happen at most once is keyed: payment events by
/// gateway event id, orders by `(checkout_session_id, product_id)`,
/// entitlements by `(buyer_id, product_id)`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts the event if absent. An existing event is handed out again
    /// only when it was released or its lease lapsed without completion.
    async fn claim_payment_event(
        &self,
        event: &PaymentEvent,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, ServiceError>;

    async fn complete_payment_event(
        &self,
        gateway_event_id: &str,
        disposition: EventDisposition,
    ) -> Result<(), ServiceError>;

    /// Gives a claim back after a transient failure so a retry can proceed
    async fn release_payment_event(&self, gateway_event_id: &str) -> Result<(), ServiceError>;

    async fn insert_session(&self, session: &CheckoutSession) -> Result<(), ServiceError>;

    async fn load_session(&self, session_id: Uuid) -> Result<Option<CheckoutSession>, ServiceError>;

    /// Moves the session to `to` if its status is one of `from`
    async fn transition_session(
        &self,
        session_id: Uuid,
        from: &[CheckoutStatus],
        to: CheckoutStatus,
        authorization_id: Option<String>,
    ) -> Result<bool, ServiceError>;

    /// Order, entitlement and counters for one cart line, in one transaction
    async fn materialize_item(
        &self,
        session: &CheckoutSession,
        item: &CartItem,
        fees: &FeePolicy,
    ) -> Result<InsertOutcome, ServiceError>;

    /// Expires open sessions created before `cutoff` that have no payment
    /// event in flight
    async fn expire_sessions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError>;

    async fn orders_for_session(&self, session_id: Uuid) -> Result<Vec<order::Model>, ServiceError>;

    async fn orders_for_buyer(&self, buyer_id: &str) -> Result<Vec<order::Model>, ServiceError>;

    async fn find_order(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError>;

    async fn has_entitlement(&self, buyer_id: &str, product_id: &str) -> Result<bool, ServiceError>;

    async fn seller_ledger(
        &self,
        seller_id: &str,
    ) -> Result<Option<seller_ledger::Model>, ServiceError>;

    async fn product_ledger(
        &self,
        product_id: &str,
    ) -> Result<Option<product_ledger::Model>, ServiceError>;

    /// `completed -> refunded`, reversing the counters. Entitlements stay.
    async fn refund_order(&self, order_id: Uuid) -> Result<RefundOutcome, ServiceError>;
}

/// [`LedgerStore`] on a relational database through sea-orm
#[derive(Clone)]
pub struct SeaOrmLedgerStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmLedgerStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, ServiceError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| ServiceError::InternalError(format!("lease out of range: {}", e)))
}

/// Commutative counter update for one order's seller and product
pub async fn upsert_counter_delta<C: ConnectionTrait>(
    conn: &C,
    seller_id: &str,
    product_id: &str,
    delta: CounterDelta,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    let seller = seller_ledger::ActiveModel {
        seller_id: Set(seller_id.to_string()),
        sales_count: Set(delta.sales),
        earnings_minor_units: Set(delta.seller_earnings_minor_units),
        updated_at: Set(now),
    };
    seller_ledger::Entity::insert(seller)
        .on_conflict(
            OnConflict::column(seller_ledger::Column::SellerId)
                .value(
                    seller_ledger::Column::SalesCount,
                    Expr::col((seller_ledger::Entity, seller_ledger::Column::SalesCount))
                        .add(delta.sales),
                )
                .value(
                    seller_ledger::Column::EarningsMinorUnits,
                    Expr::col((
                        seller_ledger::Entity,
                        seller_ledger::Column::EarningsMinorUnits,
                    ))
                    .add(delta.seller_earnings_minor_units),
                )
                .update_column(seller_ledger::Column::UpdatedAt)
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    let product = product_ledger::ActiveModel {
        product_id: Set(product_id.to_string()),
        sales_count: Set(delta.sales),
        revenue_minor_units: Set(delta.revenue_minor_units),
        updated_at: Set(now),
    };
    product_ledger::Entity::insert(product)
        .on_conflict(
            OnConflict::column(product_ledger::Column::ProductId)
                .value(
                    product_ledger::Column::SalesCount,
                    Expr::col((product_ledger::Entity, product_ledger::Column::SalesCount))
                        .add(delta.sales),
                )
                .value(
                    product_ledger::Column::RevenueMinorUnits,
                    Expr::col((
                        product_ledger::Entity,
                        product_ledger::Column::RevenueMinorUnits,
                    ))
                    .add(delta.revenue_minor_units),
                )
                .update_column(product_ledger::Column::UpdatedAt)
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    Ok(())
}

#[async_trait]
impl LedgerStore for SeaOrmLedgerStore {
    #[instrument(skip(self, event), fields(gateway_event_id = %event.gateway_event_id))]
    async fn claim_payment_event(
        &self,
        event: &PaymentEvent,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, ServiceError> {
        let lease_expires_at = now + to_chrono(lease)?;

        let row = payment_event::ActiveModel {
            gateway_event_id: Set(event.gateway_event_id.clone()),
            checkout_session_id: Set(event.checkout_session_id),
            outcome: Set(event.outcome),
            status: Set(PaymentEventStatus::Processing),
            attempts: Set(1),
            lease_expires_at: Set(Some(lease_expires_at)),
            received_at: Set(event.received_at),
            completed_at: Set(None),
        };
        let inserted = payment_event::Entity::insert(row)
            .on_conflict(
                OnConflict::column(payment_event::Column::GatewayEventId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        if inserted == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        let reclaimable = Condition::any()
            .add(payment_event::Column::Status.eq(PaymentEventStatus::Released))
            .add(
                Condition::all()
                    .add(payment_event::Column::Status.eq(PaymentEventStatus::Processing))
                    .add(payment_event::Column::LeaseExpiresAt.lt(now)),
            );
        let reclaimed = payment_event::Entity::update_many()
            .col_expr(
                payment_event::Column::Status,
                Expr::value(PaymentEventStatus::Processing),
            )
            .col_expr(
                payment_event::Column::LeaseExpiresAt,
                Expr::value(lease_expires_at),
            )
            .col_expr(
                payment_event::Column::Attempts,
                Expr::col(payment_event::Column::Attempts).add(1),
            )
            .filter(payment_event::Column::GatewayEventId.eq(event.gateway_event_id.as_str()))
            .filter(reclaimable)
            .exec(&*self.db)
            .await?
            .rows_affected;

        if reclaimed == 1 {
            info!("Reclaimed payment event after release or lapsed lease");
            counter!("promptmarket_ledger.payment_event_reclaimed", 1);
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::AlreadyProcessed)
        }
    }

    #[instrument(skip(self))]
    async fn complete_payment_event(
        &self,
        gateway_event_id: &str,
        disposition: EventDisposition,
    ) -> Result<(), ServiceError> {
        let status: PaymentEventStatus = disposition.into();
        let updated = payment_event::Entity::update_many()
            .col_expr(payment_event::Column::Status, Expr::value(status))
            .col_expr(
                payment_event::Column::CompletedAt,
                Expr::value(Some(Utc::now())),
            )
            .col_expr(
                payment_event::Column::LeaseExpiresAt,
                Expr::value(None::<DateTime<Utc>>),
            )
            .filter(payment_event::Column::GatewayEventId.eq(gateway_event_id))
            .filter(payment_event::Column::Status.eq(PaymentEventStatus::Processing))
            .exec(&*self.db)
            .await?
            .rows_affected;

        if updated == 0 {
            warn!("Payment event was not in processing state when completed");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_payment_event(&self, gateway_event_id: &str) -> Result<(), ServiceError> {
        payment_event::Entity::update_many()
            .col_expr(
                payment_event::Column::Status,
                Expr::value(PaymentEventStatus::Released),
            )
            .col_expr(
                payment_event::Column::LeaseExpiresAt,
                Expr::value(None::<DateTime<Utc>>),
            )
            .filter(payment_event::Column::GatewayEventId.eq(gateway_event_id))
            .filter(payment_event::Column::Status.eq(PaymentEventStatus::Processing))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, session), fields(session_id = %session.id))]
    async fn insert_session(&self, session: &CheckoutSession) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        checkout_session::Entity::insert(checkout_session::ActiveModel {
            id: Set(session.id),
            buyer_id: Set(session.buyer_id.clone()),
            total_minor_units: Set(session.total_minor_units),
            currency: Set(session.currency.clone()),
            status: Set(session.status),
            gateway_authorization_id: Set(session.gateway_authorization_id.clone()),
            created_at: Set(session.created_at),
            updated_at: Set(session.updated_at),
        })
        .exec_without_returning(&txn)
        .await?;

        if !session.items.is_empty() {
            let items = session
                .items
                .iter()
                .enumerate()
                .map(|(position, item)| checkout_session_item::ActiveModel {
                    checkout_session_id: Set(session.id),
                    product_id: Set(item.product_id.clone()),
                    seller_id: Set(item.seller_id.clone()),
                    unit_price_minor_units: Set(item.unit_price_minor_units),
                    position: Set(position as i32),
                });
            checkout_session_item::Entity::insert_many(items)
                .exec_without_returning(&txn)
                .await?;
        }

        txn.commit().await?;
        debug!(items = session.items.len(), "Checkout session persisted");
        Ok(())
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Option<CheckoutSession>, ServiceError> {
        let Some(session) = checkout_session::Entity::find_by_id(session_id)
            .one(&*self.db)
            .await?
        else {
            return Ok(None);
        };

        let items = checkout_session_item::Entity::find()
            .filter(checkout_session_item::Column::CheckoutSessionId.eq(session_id))
            .all(&*self.db)
            .await?;

        Ok(Some(CheckoutSession::from_parts(session, items)))
    }

    #[instrument(skip(self, from))]
    async fn transition_session(
        &self,
        session_id: Uuid,
        from: &[CheckoutStatus],
        to: CheckoutStatus,
        authorization_id: Option<String>,
    ) -> Result<bool, ServiceError> {
        let mut update = checkout_session::Entity::update_many()
            .col_expr(checkout_session::Column::Status, Expr::value(to))
            .col_expr(checkout_session::Column::UpdatedAt, Expr::value(Utc::now()));
        if let Some(authorization_id) = authorization_id {
            update = update.col_expr(
                checkout_session::Column::GatewayAuthorizationId,
                Expr::value(authorization_id),
            );
        }

        let rows = update
            .filter(checkout_session::Column::Id.eq(session_id))
            .filter(checkout_session::Column::Status.is_in(from.iter().copied()))
            .exec(&*self.db)
            .await?
            .rows_affected;

        Ok(rows == 1)
    }

    #[instrument(skip(self, session, item, fees), fields(session_id = %session.id, product_id = %item.product_id))]
    async fn materialize_item(
        &self,
        session: &CheckoutSession,
        item: &CartItem,
        fees: &FeePolicy,
    ) -> Result<InsertOutcome, ServiceError> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let seller_earnings = fees.seller_earnings(item.unit_price_minor_units);

        let txn = self.db.begin().await?;

        let inserted = order::Entity::insert(order::ActiveModel {
            id: Set(order_id),
            checkout_session_id: Set(session.id),
            product_id: Set(item.product_id.clone()),
            buyer_id: Set(session.buyer_id.clone()),
            seller_id: Set(item.seller_id.clone()),
            amount_minor_units: Set(item.unit_price_minor_units),
            seller_earnings_minor_units: Set(seller_earnings),
            currency: Set(session.currency.clone()),
            status: Set(OrderStatus::Completed),
            created_at: Set(now),
            refunded_at: Set(None),
        })
        .on_conflict(
            OnConflict::columns([order::Column::CheckoutSessionId, order::Column::ProductId])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

        if inserted == 0 {
            // Materialized by an earlier attempt; its counters are already in.
            txn.commit().await?;
            debug!("Order already materialized");
            return Ok(InsertOutcome::AlreadyExisted);
        }

        entitlement::Entity::insert(entitlement::ActiveModel {
            buyer_id: Set(session.buyer_id.clone()),
            product_id: Set(item.product_id.clone()),
            order_id: Set(order_id),
            granted_at: Set(now),
        })
        .on_conflict(
            OnConflict::columns([entitlement::Column::BuyerId, entitlement::Column::ProductId])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

        upsert_counter_delta(
            &txn,
            &item.seller_id,
            &item.product_id,
            CounterDelta::sale(item.unit_price_minor_units, seller_earnings),
            now,
        )
        .await?;

        txn.commit().await?;
        counter!("promptmarket_ledger.orders_materialized", 1);
        Ok(InsertOutcome::Inserted)
    }

    #[instrument(skip(self))]
    async fn expire_sessions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        // A session with a payment in flight, a released success awaiting
        // its retry, or any materialized order is paid for and must settle
        let paying = Query::select()
            .column(payment_event::Column::CheckoutSessionId)
            .from(payment_event::Entity)
            .cond_where(
                Condition::any()
                    .add(
                        Condition::all()
                            .add(payment_event::Column::Status.eq(PaymentEventStatus::Processing))
                            .add(payment_event::Column::LeaseExpiresAt.gt(now)),
                    )
                    .add(
                        Condition::all()
                            .add(payment_event::Column::Status.eq(PaymentEventStatus::Released))
                            .add(payment_event::Column::Outcome.eq(PaymentOutcome::Succeeded)),
                    ),
            )
            .to_owned();
        let materialized = Query::select()
            .column(order::Column::CheckoutSessionId)
            .from(order::Entity)
            .to_owned();

        let expired = checkout_session::Entity::update_many()
            .col_expr(
                checkout_session::Column::Status,
                Expr::value(CheckoutStatus::Expired),
            )
            .col_expr(checkout_session::Column::UpdatedAt, Expr::value(now))
            .filter(checkout_session::Column::Status.is_in(CheckoutStatus::OPEN))
            .filter(checkout_session::Column::CreatedAt.lt(cutoff))
            .filter(checkout_session::Column::Id.not_in_subquery(paying))
            .filter(checkout_session::Column::Id.not_in_subquery(materialized))
            .exec(&*self.db)
            .await?
            .rows_affected;

        Ok(expired)
    }

    async fn orders_for_session(&self, session_id: Uuid) -> Result<Vec<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::CheckoutSessionId.eq(session_id))
            .order_by_asc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn orders_for_buyer(&self, buyer_id: &str) -> Result<Vec<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::BuyerId.eq(buyer_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find_by_id(order_id).one(&*self.db).await?)
    }

    async fn has_entitlement(&self, buyer_id: &str, product_id: &str) -> Result<bool, ServiceError> {
        let found = entitlement::Entity::find_by_id((buyer_id.to_string(), product_id.to_string()))
            .one(&*self.db)
            .await?;
        Ok(found.is_some())
    }

    async fn seller_ledger(
        &self,
        seller_id: &str,
    ) -> Result<Option<seller_ledger::Model>, ServiceError> {
        Ok(seller_ledger::Entity::find_by_id(seller_id.to_string())
            .one(&*self.db)
            .await?)
    }

    async fn product_ledger(
        &self,
        product_id: &str,
    ) -> Result<Option<product_ledger::Model>, ServiceError> {
        Ok(product_ledger::Entity::find_by_id(product_id.to_string())
            .one(&*self.db)
            .await?)
    }

    #[instrument(skip(self))]
    async fn refund_order(&self, order_id: Uuid) -> Result<RefundOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;

        let now = Utc::now();
        let updated = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Refunded))
            .col_expr(order::Column::RefundedAt, Expr::value(Some(now)))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Completed))
            .exec(&txn)
            .await?
            .rows_affected;

        if updated == 0 {
            txn.commit().await?;
            return Ok(RefundOutcome::AlreadyRefunded(order));
        }

        upsert_counter_delta(
            &txn,
            &order.seller_id,
            &order.product_id,
            CounterDelta::reversal(&order),
            now,
        )
        .await?;
        txn.commit().await?;

        counter!("promptmarket_ledger.orders_refunded", 1);
        Ok(RefundOutcome::Refunded(order::Model {
            status: OrderStatus::Refunded,
            refunded_at: Some(now),
            ..order
        }))
    }
}
