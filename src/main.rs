use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use promptmarket_api as api;
use api::{
    events::{process_events, EventSender},
    services::{
        catalog::DbCatalogReader,
        fulfillment::{start_expiry_worker, FulfillmentEngine, FulfillmentSettings},
        ledger::SeaOrmLedgerStore,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db_pool);

    // Init events
    let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
    tokio::spawn(process_events(event_rx, Vec::new()));

    let gateway = api::gateway::build_gateway(&cfg).context("failed to build payment gateway")?;
    if gateway.name() == "mock" {
        warn!("Using the mock payment gateway; no real money moves");
    }

    let engine = FulfillmentEngine::new(
        Arc::new(SeaOrmLedgerStore::new(db.clone())),
        Arc::new(DbCatalogReader::new(db.clone())),
        gateway,
        FulfillmentSettings::from(&cfg),
    )
    .with_events(event_sender);

    let sweeper = match cfg.expiry_sweep_interval() {
        Some(interval) => Some(start_expiry_worker(engine.clone(), interval)),
        None => {
            info!("Checkout expiry sweeper disabled");
            None
        }
    };

    let app = api::app_router(api::AppState::new(db, cfg.clone(), engine));

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;
    info!("promptmarket-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
