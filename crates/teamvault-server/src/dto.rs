//! Request and response bodies for the HTTP surface. Kept separate from
//! `teamvault-types`'s entities since the wire shape (what a client sends
//! or sees) and the persisted shape (wrapped DEKs, nonces) are different
//! concerns — a [`Lease`](teamvault_types::Lease) or
//! [`Webhook`](teamvault_types::Webhook) response never carries its raw
//! envelope fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teamvault_types::{Lease, ReplicationEntry, Secret, SecretType, ServiceAccount, VectorClock, Webhook};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "member".to_string()
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub actor_type: String,
    pub actor_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PutSecretRequest {
    pub value: String,
    #[serde(default)]
    pub secret_type: Option<SecretType>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct SecretValueResponse {
    pub project: String,
    pub path: String,
    pub version: i64,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct SecretMetadataResponse {
    pub path: String,
    pub secret_type: SecretType,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Secret> for SecretMetadataResponse {
    fn from(secret: Secret) -> Self {
        Self {
            path: secret.path,
            secret_type: secret.secret_type,
            created_by: secret.created_by,
            created_at: secret.created_at,
            updated_at: secret.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SecretVersionResponse {
    pub version: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceAccountRequest {
    pub project: String,
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_in_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ServiceAccountResponse {
    pub id: Uuid,
    pub name: String,
    pub token: String,
}

impl ServiceAccountResponse {
    pub fn new(sa: ServiceAccount, token: String) -> Self {
        Self { id: sa.id, name: sa.name, token }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct IssueLeaseRequest {
    #[serde(default)]
    pub ttl_secs: Option<i64>,
    #[serde(default)]
    pub org_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct LeaseResponse {
    pub id: Uuid,
    pub lease_type: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub credential: serde_json::Value,
}

impl LeaseResponse {
    pub fn new(lease: Lease, credential: impl Serialize) -> Self {
        Self {
            id: lease.id,
            lease_type: lease.lease_type,
            issued_at: lease.issued_at,
            expires_at: lease.expires_at,
            credential: serde_json::to_value(credential).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct AuditQueryParams {
    pub actor_type: Option<String>,
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReplicationPushRequest {
    pub entries: Vec<ReplicationEntry>,
}

#[derive(Debug, Serialize)]
pub struct ReplicationPushResponse {
    pub applied: usize,
}

#[derive(Debug, Deserialize, Default)]
pub struct ReplicationPullRequest {
    #[serde(default)]
    pub after_id: i64,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReplicationPullResponse {
    pub entries: Vec<ReplicationEntry>,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct ReplicationStatusResponse {
    pub node_id: String,
    pub clock: VectorClock,
}

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub id: Uuid,
    pub url: String,
    pub secret: String,
}

impl WebhookResponse {
    pub fn new(webhook: Webhook, secret: String) -> Self {
        Self { id: webhook.id, url: webhook.url, secret }
    }
}

#[derive(Debug, Deserialize)]
pub struct DispatchWebhookEventRequest {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct DispatchWebhookEventResponse {
    pub delivered: usize,
}
