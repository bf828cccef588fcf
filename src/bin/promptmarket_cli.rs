use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use promptmarket_api::{
    auth::{JwtAuth, ADMIN_ROLE},
    config::{self, AppConfig},
    db::{self, DbPool},
    gateway,
    services::{
        catalog::DbCatalogReader,
        fulfillment::{FulfillmentEngine, FulfillmentSettings},
        ledger::{LedgerStore, RefundOutcome, SeaOrmLedgerStore},
    },
};

#[derive(Parser)]
#[command(
    name = "promptmarket",
    about = "Operator CLI for checkout, orders and seller ledgers",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Expire checkout sessions older than the configured expiry
    SweepExpired,
    /// Refund a completed order and reverse its ledger counters
    Refund { order_id: Uuid },
    /// List a buyer's orders, newest first
    Orders { buyer_id: String },
    #[command(subcommand)]
    Ledger(LedgerCommands),
    /// Issue a bearer token for local testing
    IssueToken {
        buyer_id: String,
        #[arg(long, action = ArgAction::SetTrue)]
        admin: bool,
        #[arg(long, default_value_t = 60)]
        ttl_minutes: i64,
    },
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// Sales count and earnings for a seller
    Seller { seller_id: String },
    /// Sales count and revenue for a product
    Product { product_id: String },
}

struct CliContext {
    config: AppConfig,
    db: Arc<DbPool>,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load configuration")?;
        config::init_tracing(config.log_level(), false);
        let db = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        Ok(Self {
            config,
            db: Arc::new(db),
        })
    }

    fn ledger(&self) -> SeaOrmLedgerStore {
        SeaOrmLedgerStore::new(self.db.clone())
    }

    fn engine(&self) -> Result<FulfillmentEngine> {
        let gateway = gateway::build_gateway(&self.config)
            .map_err(|e| anyhow!("failed to build payment gateway: {}", e))?;
        Ok(FulfillmentEngine::new(
            Arc::new(self.ledger()),
            Arc::new(DbCatalogReader::new(self.db.clone())),
            gateway,
            FulfillmentSettings::from(&self.config),
        ))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&context.db)
                .await
                .context("migrations failed")?;
            println!("Migrations applied");
        }
        Commands::SweepExpired => {
            let expired = context
                .engine()?
                .expire_stale_sessions(Utc::now())
                .await
                .map_err(|e| anyhow!("expiry sweep failed: {}", e))?;
            println!("Expired {} checkout session(s)", expired);
        }
        Commands::Refund { order_id } => {
            let outcome = context
                .engine()?
                .refund_order(order_id)
                .await
                .map_err(|e| anyhow!("refund failed: {}", e))?;
            let (order, note) = match outcome {
                RefundOutcome::Refunded(order) => (order, "refunded"),
                RefundOutcome::AlreadyRefunded(order) => (order, "was already refunded"),
            };
            if cli.json {
                print_json(&order)?;
            } else {
                println!(
                    "Order {} {} ({} {})",
                    order.id, note, order.amount_minor_units, order.currency
                );
            }
        }
        Commands::Orders { buyer_id } => {
            let orders = context
                .ledger()
                .orders_for_buyer(&buyer_id)
                .await
                .map_err(|e| anyhow!("failed to list orders: {}", e))?;
            if cli.json {
                print_json(&orders)?;
            } else if orders.is_empty() {
                println!("No orders for {}", buyer_id);
            } else {
                for order in orders {
                    println!(
                        "{}  {}  {:>10} {}  {}  {}",
                        order.created_at.to_rfc3339(),
                        order.id,
                        order.amount_minor_units,
                        order.currency,
                        order.product_id,
                        order.status
                    );
                }
            }
        }
        Commands::Ledger(LedgerCommands::Seller { seller_id }) => {
            let ledger = context
                .ledger()
                .seller_ledger(&seller_id)
                .await
                .map_err(|e| anyhow!("failed to read seller ledger: {}", e))?;
            match (ledger, cli.json) {
                (Some(ledger), true) => print_json(&ledger)?,
                (Some(ledger), false) => println!(
                    "Seller {}: {} sale(s), {} earned",
                    ledger.seller_id, ledger.sales_count, ledger.earnings_minor_units
                ),
                (None, _) => println!("No sales recorded for seller {}", seller_id),
            }
        }
        Commands::Ledger(LedgerCommands::Product { product_id }) => {
            let ledger = context
                .ledger()
                .product_ledger(&product_id)
                .await
                .map_err(|e| anyhow!("failed to read product ledger: {}", e))?;
            match (ledger, cli.json) {
                (Some(ledger), true) => print_json(&ledger)?,
                (Some(ledger), false) => println!(
                    "Product {}: {} sale(s), {} revenue",
                    ledger.product_id, ledger.sales_count, ledger.revenue_minor_units
                ),
                (None, _) => println!("No sales recorded for product {}", product_id),
            }
        }
        Commands::IssueToken {
            buyer_id,
            admin,
            ttl_minutes,
        } => {
            let roles: &[&str] = if admin { &[ADMIN_ROLE] } else { &[] };
            let token = JwtAuth::new(&context.config.jwt_secret)
                .issue_token(&buyer_id, roles, ChronoDuration::minutes(ttl_minutes))
                .map_err(|e| anyhow!("failed to issue token: {}", e))?;
            println!("{}", token);
        }
    }

    Ok(())
}
