use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{
    checkout_session::{self, CheckoutStatus},
    checkout_session_item,
    payment_event::PaymentOutcome,
};

/// A product selected for purchase. Digital goods, so quantity is always one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: String,
    pub unit_price_minor_units: i64,
    pub seller_id: String,
}

impl CartItem {
    pub fn new(
        product_id: impl Into<String>,
        unit_price_minor_units: i64,
        seller_id: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            unit_price_minor_units,
            seller_id: seller_id.into(),
        }
    }
}

/// A buyer's attempt to pay for a cart, with its items loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub buyer_id: String,
    pub items: Vec<CartItem>,
    pub total_minor_units: i64,
    pub currency: String,
    pub status: CheckoutStatus,
    pub gateway_authorization_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutSession {
    /// New session in `created`; the total is computed from the items.
    pub fn open(buyer_id: impl Into<String>, items: Vec<CartItem>, currency: impl Into<String>) -> Self {
        let now = Utc::now();
        let total_minor_units = items.iter().map(|item| item.unit_price_minor_units).sum();
        Self {
            id: Uuid::new_v4(),
            buyer_id: buyer_id.into(),
            items,
            total_minor_units,
            currency: currency.into(),
            status: CheckoutStatus::Created,
            gateway_authorization_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn from_parts(
        session: checkout_session::Model,
        mut items: Vec<checkout_session_item::Model>,
    ) -> Self {
        items.sort_by_key(|item| item.position);
        Self {
            id: session.id,
            buyer_id: session.buyer_id,
            items: items
                .into_iter()
                .map(|item| CartItem {
                    product_id: item.product_id,
                    unit_price_minor_units: item.unit_price_minor_units,
                    seller_id: item.seller_id,
                })
                .collect(),
            total_minor_units: session.total_minor_units,
            currency: session.currency,
            status: session.status,
            gateway_authorization_id: session.gateway_authorization_id,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

/// A verified payment outcome reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub gateway_event_id: String,
    pub checkout_session_id: Uuid,
    pub outcome: PaymentOutcome,
    pub received_at: DateTime<Utc>,
}

impl PaymentEvent {
    pub fn new(
        gateway_event_id: impl Into<String>,
        checkout_session_id: Uuid,
        outcome: PaymentOutcome,
    ) -> Self {
        Self {
            gateway_event_id: gateway_event_id.into(),
            checkout_session_id,
            outcome,
            received_at: Utc::now(),
        }
    }
}
