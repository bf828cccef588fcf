use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Bounded channel with its sending half wrapped
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends without failing the caller; a closed channel is only logged
    pub async fn publish(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Checkout lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CheckoutCreated {
        session_id: Uuid,
        buyer_id: String,
        total_minor_units: i64,
        currency: String,
    },
    CheckoutSettled {
        session_id: Uuid,
        buyer_id: String,
        orders_created: usize,
    },
    CheckoutFailed {
        session_id: Uuid,
        reason: String,
    },
    CheckoutsExpired {
        count: u64,
        cutoff: DateTime<Utc>,
    },
    OrderRefunded {
        order_id: Uuid,
        seller_id: String,
        amount_minor_units: i64,
    },
    /// Money was captured for a session that can no longer be fulfilled
    RefundRequired {
        session_id: Uuid,
        gateway_event_id: String,
        authorization_id: Option<String>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::CheckoutCreated { .. } => "checkout_created",
            Event::CheckoutSettled { .. } => "checkout_settled",
            Event::CheckoutFailed { .. } => "checkout_failed",
            Event::CheckoutsExpired { .. } => "checkouts_expired",
            Event::OrderRefunded { .. } => "order_refunded",
            Event::RefundRequired { .. } => "refund_required",
        }
    }
}

/// Downstream consumer of checkout events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Drains `rx`, logging every event and passing it to each handler in turn
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("promptmarket_events.processed", 1, "event" => event.name());

        match &event {
            Event::RefundRequired {
                session_id,
                gateway_event_id,
                authorization_id,
            } => {
                error!(
                    %session_id,
                    %gateway_event_id,
                    authorization_id = authorization_id.as_deref().unwrap_or("-"),
                    "Payment captured after checkout expiry; refund required"
                );
            }
            Event::CheckoutFailed { session_id, reason } => {
                warn!(%session_id, %reason, "Checkout failed");
            }
            other => info!(event = other.name(), "Received event: {:?}", other),
        }

        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!(event = event.name(), error = %e, "Event handler failed");
            }
        }
    }

    warn!("Event processing loop has ended");
}
