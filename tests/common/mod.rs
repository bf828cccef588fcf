#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use promptmarket_api::{
    auth::{JwtAuth, ADMIN_ROLE},
    config::AppConfig,
    db::{self, DbConfig},
    entities::checkout_session::CheckoutStatus,
    events::{self, Event, EventHandler, EventSender},
    gateway::{MockGateway, SIGNATURE_HEADER},
    middleware_helpers::RetryConfig,
    models::CartItem,
    services::{
        catalog::{CatalogProduct, InMemoryCatalog},
        fulfillment::{CreatedCheckout, FulfillmentEngine, FulfillmentSettings},
        ledger::{LedgerStore, SeaOrmLedgerStore},
        payout::FeePolicy,
    },
    AppState,
};
use sea_orm::DatabaseConnection;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";

/// Collects every published event for assertions
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events lock").clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        self.events.lock().expect("events lock").push(event.clone());
        Ok(())
    }
}

/// Fresh, migrated in-memory database
pub async fn test_db() -> Arc<DatabaseConnection> {
    let pool = db::establish_connection_with_config(&DbConfig::in_memory_sqlite())
        .await
        .expect("failed to create test database");
    db::run_migrations(&pool)
        .await
        .expect("failed to run migrations in tests");
    Arc::new(pool)
}

/// Short timeouts and fast retries so failure paths finish quickly
pub fn test_settings() -> FulfillmentSettings {
    FulfillmentSettings {
        default_currency: "USD".to_string(),
        catalog_timeout: Duration::from_millis(500),
        gateway_timeout: Duration::from_millis(200),
        ledger_timeout: Duration::from_secs(5),
        finalize_lease: Duration::from_secs(30),
        checkout_expiry: Duration::from_secs(3600),
        retry: RetryConfig::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(5)),
        fee_policy: FeePolicy::default(),
    }
}

/// p1 and p3 belong to s1, p2 to s2; `retired` cannot be bought
pub fn seeded_catalog() -> InMemoryCatalog {
    InMemoryCatalog::with_products([
        CatalogProduct::new("p1", "s1", 499, "USD"),
        CatalogProduct::new("p2", "s2", 1000, "USD"),
        CatalogProduct::new("p3", "s1", 250, "USD"),
        CatalogProduct::new("retired", "s2", 300, "USD").unavailable(),
    ])
}

pub fn item(product_id: &str, price: i64, seller_id: &str) -> CartItem {
    CartItem::new(product_id, price, seller_id)
}

/// Application state backed by an in-memory SQLite database, the in-memory
/// catalog and the mock gateway.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub db: Arc<DatabaseConnection>,
    pub catalog: Arc<InMemoryCatalog>,
    pub gateway: MockGateway,
    pub ledger: Arc<SeaOrmLedgerStore>,
    pub engine: FulfillmentEngine,
    pub recorder: Arc<RecordingHandler>,
    event_sender: EventSender,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let db = test_db().await;
        let catalog = Arc::new(seeded_catalog());
        let gateway = MockGateway::default();
        let ledger = Arc::new(SeaOrmLedgerStore::new(db.clone()));

        let (event_sender, event_rx) = EventSender::channel(256);
        let recorder = Arc::new(RecordingHandler::default());
        let event_task = tokio::spawn(events::process_events(
            event_rx,
            vec![recorder.clone() as Arc<dyn EventHandler>],
        ));

        let engine = FulfillmentEngine::new(
            ledger.clone(),
            catalog.clone(),
            Arc::new(gateway.clone()),
            test_settings(),
        )
        .with_events(event_sender.clone());

        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.auto_migrate = true;

        let state = AppState::new(db.clone(), cfg, engine.clone());
        let router = promptmarket_api::app_router(state.clone());

        Self {
            router,
            state,
            db,
            catalog,
            gateway,
            ledger,
            engine,
            recorder,
            event_sender,
            _event_task: event_task,
        }
    }

    /// Engine sharing this app's catalog, gateway and events over another store
    pub fn engine_with_ledger(&self, ledger: Arc<dyn LedgerStore>) -> FulfillmentEngine {
        FulfillmentEngine::new(
            ledger,
            self.catalog.clone(),
            Arc::new(self.gateway.clone()),
            test_settings(),
        )
        .with_events(self.event_sender.clone())
    }

    pub fn token_for(&self, buyer_id: &str) -> String {
        JwtAuth::new(JWT_SECRET)
            .issue_token(buyer_id, &[], chrono::Duration::hours(1))
            .expect("issue buyer token")
    }

    pub fn admin_token(&self) -> String {
        JwtAuth::new(JWT_SECRET)
            .issue_token("operator", &[ADMIN_ROLE], chrono::Duration::hours(1))
            .expect("issue admin token")
    }

    /// Creates and authorizes a checkout directly through the engine
    pub async fn checkout(&self, buyer_id: &str, items: &[CartItem]) -> CreatedCheckout {
        self.engine
            .create_checkout(buyer_id, items, None)
            .await
            .expect("checkout should be created")
    }

    pub async fn session_status(&self, session_id: Uuid) -> CheckoutStatus {
        self.engine
            .get_session(session_id)
            .await
            .expect("session exists")
            .status
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Delivers a raw webhook body, optionally signed
    pub async fn post_webhook(&self, payload: Vec<u8>, signature: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }

        let request = builder
            .body(Body::from(payload))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook request")
    }

    /// Waits until the event processor has seen an event matching `pred`
    pub async fn wait_for_event(&self, pred: impl Fn(&Event) -> bool) -> Event {
        for _ in 0..100 {
            if let Some(event) = self.recorder.events().into_iter().find(|e| pred(e)) {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected event was never published");
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read response body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("response body is JSON")
}
