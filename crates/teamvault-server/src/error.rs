//! Uniform translation from every crate's leaf error into an HTTP response.
//!
//! Every collaborator crate's error enum implements `Categorize`; this type
//! is the single place that turns a category into a status code and a
//! response body, so no handler ever matches on a concrete error type
//! itself.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use teamvault_types::errors::{Categorize, ErrorCategory};

/// Errors a handler can return, either its own or bubbled up from a
/// collaborator crate via `?`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request body, missing field, or size-limit violation.
    #[error("{0}")]
    Validation(String),
    /// The request conflicts with an unrelated project/path/version.
    #[error("{0}")]
    Conflict(String),
    /// The target entity does not exist.
    #[error("not found")]
    NotFound,
    /// The caller exceeded their rate limit.
    #[error("rate limited")]
    RateLimited {
        /// Seconds the client should wait before retrying.
        retry_after_secs: u64,
    },
    /// An optional subsystem (replication, webhooks) was not configured.
    #[error("service unavailable")]
    Unavailable,
    /// Access denied by the policy engine, carrying the deny reason.
    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Auth(#[from] teamvault_auth::AuthError),
    #[error(transparent)]
    Crypto(#[from] teamvault_crypto::CryptoError),
    #[error(transparent)]
    Repository(#[from] teamvault_repository::error::RepositoryError),
    #[error(transparent)]
    Policy(#[from] teamvault_policy::PolicyError),
    #[error(transparent)]
    Rotation(#[from] teamvault_rotation::RotationError),
    #[error(transparent)]
    Lease(#[from] teamvault_lease::LeaseError),
    #[error(transparent)]
    Replication(#[from] teamvault_replication::ReplicationError),
    #[error(transparent)]
    Webhook(#[from] teamvault_webhooks::WebhookError),
    #[error(transparent)]
    Audit(#[from] teamvault_audit::AuditError),
}

impl ApiError {
    /// Policy-denied access, carrying the engine's deny reason.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        ApiError::Forbidden(reason.into())
    }

    fn category(&self) -> ErrorCategory {
        match self {
            ApiError::Validation(_) => ErrorCategory::Validation,
            ApiError::Conflict(_) => ErrorCategory::Conflict,
            ApiError::NotFound => ErrorCategory::NotFound,
            ApiError::RateLimited { .. } => ErrorCategory::RateLimited,
            ApiError::Unavailable => ErrorCategory::Unavailable,
            ApiError::Forbidden(_) => ErrorCategory::Authorization,
            ApiError::Auth(e) => e.category(),
            ApiError::Crypto(e) => e.category(),
            ApiError::Repository(e) => e.category(),
            ApiError::Policy(e) => e.category(),
            ApiError::Rotation(e) => e.category(),
            ApiError::Lease(e) => e.category(),
            ApiError::Replication(e) => e.category(),
            ApiError::Webhook(e) => e.category(),
            ApiError::Audit(e) => e.category(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let category = self.category();
        let status = StatusCode::from_u16(category.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Authentication failures always carry the constant message so a
        // client cannot distinguish failure modes; backend failures never
        // leak the underlying error text.
        let message = match category {
            ErrorCategory::Authentication => teamvault_auth::AUTH_FAILURE_MESSAGE.to_string(),
            ErrorCategory::Backend => "internal error".to_string(),
            _ => self.to_string(),
        };

        let mut response = (status, Json(ErrorBody { error: message })).into_response();
        if let ApiError::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
