use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Standard error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable error code
    pub code: String,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

/// Reasons a cart is refused at checkout. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CartValidationError {
    #[error("cart is empty")]
    EmptyCart,

    #[error("buyer id is required")]
    MissingBuyer,

    #[error("product {product_id} appears more than once in the cart")]
    DuplicateItem { product_id: String },

    #[error("product {product_id} does not exist")]
    UnknownProduct { product_id: String },

    #[error("product {product_id} is not available for purchase")]
    ProductUnavailable { product_id: String },

    #[error("price of {product_id} changed: cart has {submitted}, catalog has {current}")]
    PriceMismatch {
        product_id: String,
        submitted: i64,
        current: i64,
    },

    #[error("buyer {buyer_id} cannot purchase their own product {product_id}")]
    SelfPurchase { buyer_id: String, product_id: String },

    #[error("currency {currency} is not a 3-letter ISO code or does not match the catalog")]
    InvalidCurrency { currency: String },
}

impl CartValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyCart => "empty_cart",
            Self::MissingBuyer => "missing_buyer",
            Self::DuplicateItem { .. } => "duplicate_item",
            Self::UnknownProduct { .. } => "unknown_product",
            Self::ProductUnavailable { .. } => "product_unavailable",
            Self::PriceMismatch { .. } => "price_mismatch",
            Self::SelfPurchase { .. } => "self_purchase",
            Self::InvalidCurrency { .. } => "invalid_currency",
        }
    }
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Validation error: {0}")]
    Validation(#[from] CartValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment gateway error: {0}")]
    GatewayError(String),

    #[error("Payment gateway timed out")]
    GatewayTimeout,

    #[error("Webhook signature rejected: {0}")]
    SignatureError(String),

    #[error("Unknown checkout session {0}")]
    UnknownSession(Uuid),

    #[error("Checkout session {0} expired before payment settled")]
    SessionExpired(Uuid),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Ledger operation timed out: {0}")]
    LedgerTimeout(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::BadRequest(err.to_string())
    }
}

impl ServiceError {
    /// Convenience constructor for wrapping string-based database errors.
    pub fn database_error_message(message: impl Into<String>) -> Self {
        ServiceError::DatabaseError(DbErr::Custom(message.into()))
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(CartValidationError::PriceMismatch { .. }) => StatusCode::CONFLICT,
            Self::Validation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::SessionExpired(_) => StatusCode::GONE,
            Self::SignatureError(_) | Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::GatewayError(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::LedgerTimeout(_) | Self::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable code carried in the error body
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(reason) => reason.code(),
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::GatewayError(_) => "gateway_error",
            Self::GatewayTimeout => "gateway_timeout",
            Self::SignatureError(_) => "signature_error",
            Self::UnknownSession(_) => "unknown_session",
            Self::SessionExpired(_) => "session_expired",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::LedgerTimeout(_) => "ledger_timeout",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::InternalError(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Whether a caller may safely re-issue the same request.
    ///
    /// Gateway failures and transient store failures are retryable; validation,
    /// signature and reconciliation failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::GatewayError(_)
            | Self::GatewayTimeout
            | Self::LedgerTimeout(_)
            | Self::ServiceUnavailable(_) => true,
            Self::DatabaseError(err) => is_transient_db_error(err),
            _ => false,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            Self::SignatureError(_) => "Invalid webhook signature".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Connection-level failures that a fresh attempt may get past
pub fn is_transient_db_error(err: &DbErr) -> bool {
    matches!(
        err,
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) | DbErr::Exec(_)
    )
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            code: self.code().to_string(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
