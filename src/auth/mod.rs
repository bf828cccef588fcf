/*!
 * # Authentication
 *
 * Buyers are identified by an HS256 bearer JWT issued by the storefront's
 * identity provider. The token's `sub` is trusted as the buyer id; the
 * `admin` role unlocks operator endpoints such as refunds.
 */

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const JWT_ISSUER: &str = "promptmarket";
pub const ADMIN_ROLE: &str = "admin";

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,        // Subject (buyer id)
    #[serde(default)]
    pub roles: Vec<String>,
    pub jti: String,        // JWT ID
    pub iat: i64,           // Issued at
    pub exp: i64,           // Expiration
    pub iss: String,        // Issuer
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token creation failed: {0}")]
    TokenCreation(String),

    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::MissingToken => (StatusCode::UNAUTHORIZED, "AUTH_MISSING_TOKEN"),
            Self::InvalidToken => (StatusCode::UNAUTHORIZED, "AUTH_INVALID_TOKEN"),
            Self::TokenExpired => (StatusCode::UNAUTHORIZED, "AUTH_TOKEN_EXPIRED"),
            Self::TokenCreation(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "AUTH_TOKEN_CREATION_FAILED")
            }
            Self::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "AUTH_INSUFFICIENT_PERMISSIONS")
            }
        };

        let body = Json(serde_json::json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

impl From<AuthError> for crate::errors::ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InsufficientPermissions => Self::Forbidden(err.to_string()),
            AuthError::TokenCreation(msg) => Self::InternalError(msg),
            other => Self::Unauthorized(other.to_string()),
        }
    }
}

/// Signs and validates buyer tokens
#[derive(Clone)]
pub struct JwtAuth {
    secret: Arc<str>,
}

impl fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuth").finish_non_exhaustive()
    }
}

impl JwtAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: Arc::from(secret),
        }
    }

    /// Issues a token for `buyer_id`, used by the CLI and tests
    pub fn issue_token(
        &self,
        buyer_id: &str,
        roles: &[&str],
        ttl: ChronoDuration,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: buyer_id.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            iss: JWT_ISSUER.to_string(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenCreation(e.to_string()))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[JWT_ISSUER]);

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })
    }
}

/// The buyer identity taken from a verified bearer token
#[derive(Debug, Clone)]
pub struct AuthenticatedBuyer {
    pub buyer_id: String,
    pub roles: Vec<String>,
}

impl AuthenticatedBuyer {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn require_admin(&self) -> Result<(), AuthError> {
        if self.has_role(ADMIN_ROLE) {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermissions)
        }
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedBuyer
where
    S: Send + Sync,
    JwtAuth: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthError::MissingToken)?;
        let claims = JwtAuth::from_ref(state).validate_token(token)?;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken);
        }
        debug!(buyer_id = %claims.sub, "Authenticated buyer");

        Ok(AuthenticatedBuyer {
            buyer_id: claims.sub,
            roles: claims.roles,
        })
    }
}
