use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::services::payout::FeePolicy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_PAYMENT_PROVIDER: &str = "mock";
const DEFAULT_GATEWAY_BASE_URL: &str = "https://api.stripe.com";
const DEV_DEFAULT_JWT_SECRET: &str =
    "this_is_a_development_secret_key_that_is_at_least_64_characters_long_for_testing";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Shared secret for verifying buyer bearer tokens
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Currency used when a checkout request does not name one
    #[serde(default = "default_currency")]
    #[validate(custom = "validate_currency_code")]
    pub default_currency: String,

    /// Payment provider identifier ("mock" or "stripe")
    #[serde(default = "default_payment_provider")]
    #[validate(custom = "validate_payment_provider")]
    pub payment_provider: String,

    /// Base URL of the payment gateway API
    #[serde(default = "default_gateway_base_url")]
    pub payment_gateway_base_url: String,

    /// Secret API key for the payment gateway
    #[serde(default)]
    pub payment_gateway_api_key: Option<String>,

    /// Webhook secret for verifying payment gateway callbacks
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// Marketplace commission in basis points (2000 = 20%)
    #[serde(default = "default_platform_fee_bps")]
    #[validate(range(max = 10000))]
    pub platform_fee_bps: u32,

    /// Processor percentage fee withheld from the seller, in basis points
    #[serde(default)]
    #[validate(range(max = 10000))]
    pub processor_fee_bps: u32,

    /// Processor fixed fee withheld from the seller, per order, in minor units
    #[serde(default)]
    #[validate(range(min = 0))]
    pub processor_fee_fixed_minor_units: i64,

    /// Catalog lookup timeout (milliseconds)
    #[serde(default = "default_catalog_timeout_ms")]
    #[validate(range(min = 1))]
    pub catalog_timeout_ms: u64,

    /// Payment gateway call timeout (milliseconds)
    #[serde(default = "default_gateway_timeout_ms")]
    #[validate(range(min = 1))]
    pub gateway_timeout_ms: u64,

    /// Ledger transaction timeout (milliseconds)
    #[serde(default = "default_ledger_timeout_ms")]
    #[validate(range(min = 1))]
    pub ledger_timeout_ms: u64,

    /// How long a claimed payment event is held before another caller may retry it
    #[serde(default = "default_finalize_lease_secs")]
    #[validate(range(min = 1))]
    pub finalize_lease_secs: u64,

    /// Attempts per item materialization before Finalize gives up
    #[serde(default = "default_finalize_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub finalize_max_attempts: u32,

    /// Sessions waiting for payment longer than this are expired
    #[serde(default = "default_checkout_expiry_secs")]
    #[validate(range(min = 60))]
    pub checkout_expiry_secs: u64,

    /// Interval between expiry sweeps; 0 disables the in-process sweeper
    #[serde(default = "default_expiry_sweep_interval_secs")]
    pub expiry_sweep_interval_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            default_currency: default_currency(),
            payment_provider: default_payment_provider(),
            payment_gateway_base_url: default_gateway_base_url(),
            payment_gateway_api_key: None,
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            platform_fee_bps: default_platform_fee_bps(),
            processor_fee_bps: 0,
            processor_fee_fixed_minor_units: 0,
            catalog_timeout_ms: default_catalog_timeout_ms(),
            gateway_timeout_ms: default_gateway_timeout_ms(),
            ledger_timeout_ms: default_ledger_timeout_ms(),
            finalize_lease_secs: default_finalize_lease_secs(),
            finalize_max_attempts: default_finalize_max_attempts(),
            checkout_expiry_secs: default_checkout_expiry_secs(),
            expiry_sweep_interval_secs: default_expiry_sweep_interval_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            platform_fee_bps: self.platform_fee_bps,
            processor_fee_bps: self.processor_fee_bps,
            processor_fee_fixed_minor_units: self.processor_fee_fixed_minor_units,
        }
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_timeout_ms)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn finalize_lease(&self) -> Duration {
        Duration::from_secs(self.finalize_lease_secs)
    }

    pub fn checkout_expiry(&self) -> Duration {
        Duration::from_secs(self.checkout_expiry_secs)
    }

    /// `None` when the in-process sweeper is disabled
    pub fn expiry_sweep_interval(&self) -> Option<Duration> {
        (self.expiry_sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.expiry_sweep_interval_secs))
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.platform_fee_bps + self.processor_fee_bps > 10_000 {
            let mut err = ValidationError::new("fee_bps_total");
            err.message =
                Some("platform_fee_bps + processor_fee_bps must not exceed 10000".into());
            errors.add("platform_fee_bps", err);
        }

        if self.payment_provider.eq_ignore_ascii_case("stripe") {
            if self
                .payment_webhook_secret
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
            {
                let mut err = ValidationError::new("payment_webhook_secret_required");
                err.message = Some(
                    "Set APP__PAYMENT_WEBHOOK_SECRET when payment_provider is stripe".into(),
                );
                errors.add("payment_webhook_secret", err);
            }
            if self.payment_gateway_api_key.is_none() {
                let mut err = ValidationError::new("payment_gateway_api_key_required");
                err.message = Some(
                    "Set APP__PAYMENT_GATEWAY_API_KEY when payment_provider is stripe".into(),
                );
                errors.add("payment_gateway_api_key", err);
            }
        }

        if self.is_production() && self.payment_provider.eq_ignore_ascii_case("mock") {
            let mut err = ValidationError::new("mock_gateway_in_production");
            err.message = Some("The mock payment gateway must not be used in production".into());
            errors.add("payment_provider", err);
        }

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development. Set APP__JWT_SECRET to a unique, secure value."
                    .into(),
            );
            errors.add("jwt_secret", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Runs derive-based and cross-field validation
    pub fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.validate()?;
        self.validate_additional_constraints()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_payment_provider() -> String {
    DEFAULT_PAYMENT_PROVIDER.to_string()
}

fn default_gateway_base_url() -> String {
    DEFAULT_GATEWAY_BASE_URL.to_string()
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_platform_fee_bps() -> u32 {
    2000 // 80% to the seller
}

fn default_catalog_timeout_ms() -> u64 {
    2_000
}

fn default_gateway_timeout_ms() -> u64 {
    10_000
}

fn default_ledger_timeout_ms() -> u64 {
    5_000
}

fn default_finalize_lease_secs() -> u64 {
    60
}

fn default_finalize_max_attempts() -> u32 {
    3
}

fn default_checkout_expiry_secs() -> u64 {
    3_600
}

fn default_expiry_sweep_interval_secs() -> u64 {
    60
}

fn default_event_channel_capacity() -> usize {
    1024
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_currency_code(currency: &str) -> Result<(), ValidationError> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a 3-letter ISO code".into());
        Err(err)
    }
}

fn validate_payment_provider(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "mock" | "stripe" => Ok(()),
        _ => {
            let mut err = ValidationError::new("payment_provider");
            err.message = Some("Must be one of: mock, stripe".into());
            Err(err)
        }
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("promptmarket_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://promptmarket.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?;

    if run_env.eq_ignore_ascii_case(DEFAULT_ENV) {
        builder = builder.set_default("jwt_secret", DEV_DEFAULT_JWT_SECRET)?;
    }

    let config = builder
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to the identity provider's signing secret.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate_all().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
