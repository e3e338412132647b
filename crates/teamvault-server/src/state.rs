//! Shared, cheaply cloneable application state handed to every handler.

use std::sync::Arc;

use teamvault_audit::{AuditLogger, AuditQuery};
use teamvault_auth::JwtCodec;
use teamvault_crypto::CryptoEngine;
use teamvault_lease::LeaseManager;
use teamvault_ratelimit::RateLimiter;
use teamvault_replication::ReplicationLog;
use teamvault_repository::Repository;
use teamvault_webhooks::WebhookManager;

/// The routes in this crate never drive rotation directly — it is a
/// background-only component (see [`crate::main`]) — so no connector
/// registry handle lives here.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub crypto: Arc<CryptoEngine>,
    pub jwt: Arc<JwtCodec>,
    pub audit: Arc<AuditLogger>,
    pub audit_query: Arc<dyn AuditQuery>,
    pub rate_limiter: Arc<RateLimiter>,
    pub leases: Arc<LeaseManager>,
    pub webhooks: Arc<WebhookManager>,
    pub replication: Arc<ReplicationLog>,
}
