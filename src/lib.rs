//! Promptmarket API Library
//!
//! Checkout-to-fulfillment core for a digital goods marketplace: carts become
//! checkout sessions, confirmed payments become orders, entitlements and
//! seller payouts exactly once.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod models;
pub mod services;
pub mod tracing;

use axum::{extract::FromRef, http::HeaderValue, routing::get, Router};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer};

use crate::{auth::JwtAuth, services::fulfillment::FulfillmentEngine};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub engine: FulfillmentEngine,
    pub jwt: JwtAuth,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        engine: FulfillmentEngine,
    ) -> Self {
        let jwt = JwtAuth::new(&config.jwt_secret);
        Self {
            db,
            config,
            engine,
            jwt,
        }
    }
}

impl FromRef<AppState> for JwtAuth {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

/// CORS from `cors_allowed_origins`; permissive only in development
pub fn cors_layer(cfg: &config::AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_allowed_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    } else if cfg.is_development() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    }
}

/// Full application router with the HTTP middleware stack applied
pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api/v1", handlers::api_routes())
        .layer(crate::tracing::configure_http_tracing())
        .layer(CompressionLayer::new())
        .layer(cors)
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}
