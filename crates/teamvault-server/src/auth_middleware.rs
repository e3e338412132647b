//! Bearer-token authentication and per-IP rate limiting, applied once per
//! request ahead of every protected route.
//!
//! Order matters: the rate limit is checked before the token is even
//! classified, so a client hammering the endpoint with garbage tokens pays
//! the same 429 cost as one hammering it with valid ones — token
//! verification itself never becomes the bottleneck an attacker can abuse.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use teamvault_auth::{
    authenticate_service_account, classify_token, extract_bearer_token, service_account_not_expired,
    AuthError, Principal, TokenKind,
};
use teamvault_ratelimit::RateLimitDecision;

use crate::error::ApiError;
use crate::state::AppState;

/// Resolves the caller's [`Principal`] and inserts it as a request
/// extension for downstream handlers (extracted there via
/// `Extension<Principal>`), after confirming the client's IP has not
/// exhausted its rate-limit bucket.
pub async fn authenticate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    match state.rate_limiter.check(addr.ip()) {
        RateLimitDecision::Allowed => {}
        RateLimitDecision::Rejected { retry_after_secs } => {
            return Err(ApiError::RateLimited { retry_after_secs });
        }
    }

    let header_value = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let token = extract_bearer_token(header_value)?;

    let principal = match classify_token(token) {
        TokenKind::UserJwt(jwt) => {
            let claims = state.jwt.verify(jwt)?;
            Principal::User {
                user_id: claims.user_id,
                email: claims.email,
                role: claims.role,
            }
        }
        TokenKind::ServiceAccount(raw) => {
            let now = Utc::now();
            let candidates: Vec<_> = state
                .repo
                .list_active_service_accounts(now)
                .await?
                .into_iter()
                .filter(|sa| service_account_not_expired(sa.expires_at, now))
                .collect();
            let sa = authenticate_service_account(raw, &candidates).map_err(|_: AuthError| AuthError::InvalidToken)?;
            Principal::ServiceAccount {
                sa_id: sa.id,
                project_id: sa.project_id,
                scopes: sa.scopes.clone(),
            }
        }
    };

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}
