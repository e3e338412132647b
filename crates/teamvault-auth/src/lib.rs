#![forbid(unsafe_code)]

//! Bearer-token classification and verification.
//!
//! A request's `Authorization: Bearer <token>` header is turned into a
//! [`Principal`] two ways, chosen by a literal prefix: tokens starting with
//! `"sa."` are service-account tokens (bcrypt-hashed, compared against
//! every non-expired account); anything else is parsed as a user JWT
//! (HS256 only — any other algorithm is rejected outright).
//!
//! User passwords are hashed with Argon2; service-account and agent tokens
//! are hashed with bcrypt, matching the two different threat models (a
//! human-chosen password vs. a high-entropy random token).

use argon2::password_hash::{rand_core::OsRng as ArgonOsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use teamvault_types::errors::{Categorize, ErrorCategory};
use teamvault_types::{Action, ServiceAccount};
use uuid::Uuid;

/// Constant message returned for every authentication failure, so a client
/// cannot distinguish "no such token" from "expired" from "malformed".
pub const AUTH_FAILURE_MESSAGE: &str = "authentication failed";

const SERVICE_ACCOUNT_PREFIX: &str = "sa.";
const SERVICE_ACCOUNT_TOKEN_BYTES: usize = 32;
const JWT_ISSUER: &str = "teamvault";

/// Errors raised while authenticating a request.
///
/// Every variant maps to the same constant 401 message at the HTTP
/// boundary; the variants exist only so logs can distinguish failure
/// modes without leaking the token itself.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization` header was present.
    #[error("missing authorization header")]
    MissingHeader,
    /// The header was not a well-formed `Bearer <token>` value.
    #[error("malformed authorization header")]
    Malformed,
    /// The JWT or service-account token failed verification.
    #[error("invalid token")]
    InvalidToken,
    /// The token verified but has expired.
    #[error("token expired")]
    Expired,
    /// Password hashing or verification failed unexpectedly.
    #[error("password hashing error")]
    HashingFailed,
}

impl Categorize for AuthError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Authentication
    }
}

/// The authenticated identity attached to a request.
#[derive(Debug, Clone)]
pub enum Principal {
    /// A human user authenticated via JWT.
    User {
        /// The user's id.
        user_id: Uuid,
        /// The user's login email.
        email: String,
        /// Coarse role, used by RBAC subject matching.
        role: String,
    },
    /// A service account authenticated via an `sa.`-prefixed token.
    ServiceAccount {
        /// The service account's id.
        sa_id: Uuid,
        /// The single project this account may act against.
        project_id: Uuid,
        /// Granted scopes.
        scopes: Vec<String>,
    },
}

impl Principal {
    /// The actor-type string recorded on audit events (`"user"` or
    /// `"service_account"`).
    pub fn actor_type(&self) -> &'static str {
        match self {
            Principal::User { .. } => "user",
            Principal::ServiceAccount { .. } => "service_account",
        }
    }

    /// The actor-id string recorded on audit events.
    pub fn actor_id(&self) -> String {
        match self {
            Principal::User { user_id, .. } => user_id.to_string(),
            Principal::ServiceAccount { sa_id, .. } => sa_id.to_string(),
        }
    }

    /// For a service account, whether it is scoped to perform `action`.
    /// Always `true` for user principals — scope enforcement is a
    /// service-account-only concept; user access is governed entirely by
    /// the policy engine.
    pub fn has_scope_for(&self, action: Action) -> bool {
        match self {
            Principal::User { .. } => true,
            Principal::ServiceAccount { scopes, .. } => {
                scopes.iter().any(|s| s == "*" || s == action.as_str())
            }
        }
    }
}

/// The claims encoded in a TeamVault user JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// The user's id.
    pub user_id: Uuid,
    /// The user's login email.
    pub email: String,
    /// Coarse role.
    pub role: String,
    /// Always `"teamvault"`.
    pub iss: String,
    /// Issued-at, Unix seconds.
    pub iat: i64,
    /// Not-before, Unix seconds.
    pub nbf: i64,
    /// Expiry, Unix seconds.
    pub exp: i64,
}

/// Mints and verifies user JWTs with a single shared HS256 secret.
pub struct JwtCodec {
    secret: Vec<u8>,
    ttl: chrono::Duration,
}

impl JwtCodec {
    /// Builds a codec over `secret` (the configured `JWT_SECRET`), with
    /// tokens valid for `ttl`.
    pub fn new(secret: impl Into<Vec<u8>>, ttl: chrono::Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    /// Mints a fresh JWT for `(user_id, email, role)`, valid from now.
    pub fn mint(&self, user_id: Uuid, email: &str, role: &str) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = UserClaims {
            user_id,
            email: email.to_string(),
            role: role.to_string(),
            iss: JWT_ISSUER.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|_| AuthError::HashingFailed)
    }

    /// Verifies `token`, rejecting any algorithm other than HS256 and any
    /// `exp`/`nbf`/`iat` window violation.
    pub fn verify(&self, token: &str) -> Result<UserClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        validation.set_issuer(&[JWT_ISSUER]);

        let data = decode::<UserClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::InvalidToken,
        })?;

        let now = Utc::now().timestamp();
        if data.claims.iat > now {
            return Err(AuthError::InvalidToken);
        }

        Ok(data.claims)
    }
}

/// What kind of bearer token was presented, after classification but
/// before verification.
pub enum TokenKind<'a> {
    /// A service-account token with the `"sa."` prefix already stripped.
    ServiceAccount(&'a str),
    /// A JWT to be verified with [`JwtCodec`].
    UserJwt(&'a str),
}

/// Classifies a bearer token by its literal prefix. Does not verify it.
pub fn classify_token(token: &str) -> TokenKind<'_> {
    match token.strip_prefix(SERVICE_ACCOUNT_PREFIX) {
        Some(rest) => TokenKind::ServiceAccount(rest),
        None => TokenKind::UserJwt(token),
    }
}

/// Parses an `Authorization` header value, returning the raw bearer token.
pub fn extract_bearer_token(header_value: Option<&str>) -> Result<&str, AuthError> {
    let header_value = header_value.ok_or(AuthError::MissingHeader)?;
    header_value
        .strip_prefix("Bearer ")
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::Malformed)
}

/// Finds the service account whose bcrypt hash matches `raw_token` among
/// `candidates` (already filtered to non-expired accounts), verifying
/// every candidate's hash via `bcrypt::verify` — which runs its own
/// fixed-cost comparison internally, so the match is not vulnerable to a
/// timing side-channel on token length.
pub fn authenticate_service_account<'a>(
    raw_token: &str,
    candidates: &'a [ServiceAccount],
) -> Result<&'a ServiceAccount, AuthError> {
    candidates
        .iter()
        .find(|sa| bcrypt::verify(raw_token, &sa.token_hash).unwrap_or(false))
        .ok_or(AuthError::InvalidToken)
}

/// Generates a fresh service-account token: `"sa." + 64 hex chars` (32
/// random bytes), plus its bcrypt hash for storage. The raw value is
/// returned to the caller exactly once.
pub fn generate_service_account_token() -> Result<(String, String), AuthError> {
    let mut bytes = [0u8; SERVICE_ACCOUNT_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let raw_suffix = hex::encode(bytes);
    let raw_token = format!("{SERVICE_ACCOUNT_PREFIX}{raw_suffix}");
    let hash = bcrypt::hash(&raw_suffix, bcrypt::DEFAULT_COST).map_err(|_| AuthError::HashingFailed)?;
    Ok((raw_token, hash))
}

/// Hashes a user password with Argon2 (default parameters).
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut ArgonOsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| AuthError::HashingFailed)
}

/// Verifies a user password against a stored Argon2 hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

/// Whether `expires_at` (if present) is still in the future relative to `now`.
pub fn service_account_not_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(true, |exp| exp > now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_service_account_tokens_by_prefix() {
        match classify_token("sa.deadbeef") {
            TokenKind::ServiceAccount(rest) => assert_eq!(rest, "deadbeef"),
            TokenKind::UserJwt(_) => panic!("expected service account classification"),
        }
        match classify_token("eyJhbGciOi...") {
            TokenKind::UserJwt(_) => {}
            TokenKind::ServiceAccount(_) => panic!("expected jwt classification"),
        }
    }

    #[test]
    fn jwt_round_trips_and_rejects_tampering() {
        let codec = JwtCodec::new(b"test-secret".to_vec(), chrono::Duration::minutes(5));
        let token = codec.mint(Uuid::new_v4(), "alice@example.com", "admin").unwrap();
        let claims = codec.verify(&token).unwrap();
        assert_eq!(claims.email, "alice@example.com");

        let other_codec = JwtCodec::new(b"different-secret".to_vec(), chrono::Duration::minutes(5));
        assert!(matches!(other_codec.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn jwt_rejects_expired_tokens() {
        let codec = JwtCodec::new(b"test-secret".to_vec(), chrono::Duration::seconds(-1));
        let token = codec.mint(Uuid::new_v4(), "alice@example.com", "admin").unwrap();
        assert!(matches!(codec.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn service_account_token_round_trips_through_bcrypt() {
        let (raw, hash) = generate_service_account_token().unwrap();
        assert!(raw.starts_with("sa."));
        let suffix = raw.strip_prefix("sa.").unwrap();

        let sa = ServiceAccount {
            id: Uuid::new_v4(),
            name: "ci-bot".into(),
            token_hash: hash,
            project_id: Uuid::new_v4(),
            scopes: vec!["read".into()],
            created_by: "alice".into(),
            created_at: Utc::now(),
            expires_at: None,
        };

        let matched = authenticate_service_account(suffix, std::slice::from_ref(&sa)).unwrap();
        assert_eq!(matched.id, sa.id);
        assert!(authenticate_service_account("wrong-token", std::slice::from_ref(&sa)).is_err());
    }

    #[test]
    fn extract_bearer_token_requires_well_formed_header() {
        assert!(extract_bearer_token(None).is_err());
        assert!(extract_bearer_token(Some("Basic abc")).is_err());
        assert!(extract_bearer_token(Some("Bearer ")).is_err());
        assert_eq!(extract_bearer_token(Some("Bearer sa.abc")).unwrap(), "sa.abc");
    }
}
