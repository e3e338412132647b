#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **teamvault-types** – Shared, dependency-light entity and error types for
//! TeamVault.
//!
//! This crate sits at the bottom of the dependency graph so every other
//! crate in the workspace can depend on it without risking a cycle. It
//! intentionally makes no assumptions about cryptography, storage, or I/O –
//! it only defines the data TeamVault's components agree on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod errors;
pub use errors::ErrorCategory;

//─────────────────────────────
//  Enumerations
//─────────────────────────────

/// The stored shape of a secret's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    /// A flat key/value pair.
    Kv,
    /// A JSON document.
    Json,
    /// An opaque file blob.
    File,
}

/// Action requested against a resource during policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read the current value.
    Read,
    /// Create or update a value.
    Write,
    /// Soft-delete a value.
    Delete,
    /// List metadata.
    List,
}

impl Action {
    /// The literal wire form used in policy capability lists.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Delete => "delete",
            Action::List => "list",
        }
    }
}

/// Effect of a legacy policy statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Grants access.
    Allow,
    /// Denies access; always short-circuits.
    Deny,
}

/// Kind of principal a policy statement or request concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    /// A human user.
    User,
    /// A service account (machine principal).
    ServiceAccount,
    /// Matches any subject type.
    Any,
}

/// IAM policy document model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IamPolicyType {
    /// Role-based: subject + path + capability only.
    Rbac,
    /// Attribute-based: RBAC plus conditions.
    Abac,
    /// Full policy-document form (multiple rules, first-match semantics).
    Pbac,
}

/// Outcome recorded for an audited, security-relevant operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The operation completed and was permitted.
    Success,
    /// The operation was rejected by policy.
    Denied,
    /// The operation failed for a non-policy reason.
    Error,
}

/// Lifecycle state of a rotation schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Eligible for the next due rotation.
    Active,
    /// The last rotation attempt failed; skipped until re-created.
    Failed,
}

/// Kind of mutation recorded in the replication log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicationOp {
    /// A new row was created.
    Insert,
    /// An existing row was modified.
    Update,
    /// A row was removed.
    Delete,
}

/// Replication node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Accepts writes and fans entries out to followers.
    Leader,
    /// Pulls entries from a leader and applies them locally.
    Follower,
}

//─────────────────────────────
//  Entities
//─────────────────────────────

/// A named secret; owns zero or more [`SecretVersion`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Slash-separated path, unique within a project among non-deleted secrets.
    pub path: String,
    /// Shape of the stored value.
    pub secret_type: SecretType,
    /// Free-form, non-sensitive metadata.
    pub metadata: Option<serde_json::Value>,
    /// Subject that created the secret.
    pub created_by: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modified timestamp (bumped on every new version).
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; secrets are never physically removed.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Secret {
    /// Whether this secret is visible to ordinary reads.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An immutable, envelope-encrypted version of a [`Secret`]'s value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretVersion {
    /// Unique identifier.
    pub id: Uuid,
    /// The secret this version belongs to.
    pub secret_id: Uuid,
    /// Monotonic, gap-free version number starting at 1.
    pub version: i64,
    /// AEAD ciphertext (includes the authentication tag).
    pub ciphertext: Vec<u8>,
    /// Nonce used to seal the plaintext under the DEK.
    pub nonce: Vec<u8>,
    /// The DEK, itself sealed under the root key.
    pub wrapped_dek: Vec<u8>,
    /// Nonce used to seal the DEK under the root key.
    pub wrapped_dek_nonce: Vec<u8>,
    /// Generation of the root key used to wrap the DEK.
    pub root_key_generation: i32,
    /// Subject that authored this version (`system:rotation` for rotations).
    pub created_by: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A project: the unit secrets are namespaced under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Unique identifier.
    pub id: Uuid,
    /// Globally unique name.
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// The org this project is scoped to, if any. Drives which IAM
    /// policies the policy engine's IAM pass consults for requests
    /// against secrets under this project.
    pub org_id: Option<Uuid>,
    /// Subject that created the project.
    pub created_by: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// An organization: owns teams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Org {
    /// Unique identifier.
    pub id: Uuid,
    /// Globally unique name.
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A team: belongs to exactly one org.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning org.
    pub org_id: Uuid,
    /// Team name, unique within the org.
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A human member of a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning team.
    pub team_id: Uuid,
    /// Underlying user id.
    pub user_id: Uuid,
    /// Role within the team (used by RBAC subject matching).
    pub role: String,
}

/// A registered human user, authenticated via password login and a user JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier.
    pub id: Uuid,
    /// Login email, globally unique.
    pub email: String,
    /// Argon2 hash of the account password; the raw password is never stored.
    pub password_hash: String,
    /// Coarse role used by RBAC subject matching (e.g. `"admin"`, `"member"`).
    pub role: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A non-human, team-scoped principal with a hashed token and explicit scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning team.
    pub team_id: Uuid,
    /// Display name.
    pub name: String,
    /// Bcrypt hash of the raw agent token; the raw value is never stored.
    pub token_hash: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A project-scoped machine principal authenticating with an `sa.`-prefixed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccount {
    /// Unique identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Bcrypt hash of the raw token; the raw value is never stored.
    pub token_hash: String,
    /// The single project this account may act against.
    pub project_id: Uuid,
    /// Granted scopes (`"*"` or specific actions).
    pub scopes: Vec<String>,
    /// Subject that issued the account.
    pub created_by: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Optional expiry; an expired account is treated as absent.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ServiceAccount {
    /// Whether the account is usable right now.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| exp > now)
    }

    /// Whether `scope` grants the given action.
    pub fn has_scope_for(&self, action: Action) -> bool {
        self.scopes.iter().any(|s| s == "*" || s == action.as_str())
    }
}

/// A condition clause used by ABAC/PBAC evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Attribute name (`environment`, `mfa`, `ip_cidr`, `team`, `role`).
    pub attribute: String,
    /// Operator (`eq`/`""`, `neq`, `in`, `not_in`, `cidr_match`).
    pub operator: String,
    /// Comma-joined value list (operator-dependent interpretation).
    pub value: String,
}

/// A legacy (pre-IAM) policy statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Unique identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Allow or deny.
    pub effect: Effect,
    /// Capability list; `"*"` matches any action.
    pub actions: Vec<String>,
    /// Glob resource pattern.
    pub resource_pattern: String,
    /// Kind of subject this statement applies to.
    pub subject_type: SubjectType,
    /// Specific subject id, or `None` to match any subject of `subject_type`.
    pub subject_id: Option<String>,
    /// Additional conditions (rarely used in legacy policies).
    pub conditions: Vec<Condition>,
}

/// An org-scoped IAM policy (RBAC/ABAC/PBAC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IamPolicy {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning org.
    pub org_id: Uuid,
    /// Name, unique within the org.
    pub name: String,
    /// Evaluation model.
    pub policy_type: IamPolicyType,
    /// The policy document (shape depends on `policy_type`; see `teamvault-policy`).
    pub document: serde_json::Value,
    /// Optional original HCL source, retained for display/audit purposes only.
    pub hcl_source: Option<String>,
}

/// A tamper-evident, hash-chained security event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique identifier.
    pub id: Uuid,
    /// Event timestamp (RFC3339 with nanosecond precision, as hashed).
    pub timestamp: DateTime<Utc>,
    /// Kind of actor that performed the action.
    pub actor_type: String,
    /// Identifier of the actor.
    pub actor_id: String,
    /// Action performed.
    pub action: String,
    /// Resource acted upon.
    pub resource: String,
    /// Result of the operation.
    pub outcome: Outcome,
    /// Client IP, if known.
    pub ip: Option<String>,
    /// Canonical-JSON metadata, or an empty string if none.
    pub metadata: String,
    /// Hash of the previous event in insertion order (empty for genesis).
    pub prev_hash: String,
    /// This event's hash.
    pub hash: String,
}

/// A (secret, cadence, connector) rotation binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSchedule {
    /// Unique identifier.
    pub id: Uuid,
    /// The secret this schedule rotates.
    pub secret_id: Uuid,
    /// Schedule expression (`@every <dur>` or 5-field cron subset).
    pub schedule_expr: String,
    /// Registered connector kind.
    pub connector_type: String,
    /// Connector-specific configuration document.
    pub connector_config: serde_json::Value,
    /// Timestamp of the last successful rotation.
    pub last_rotated_at: Option<DateTime<Utc>>,
    /// Timestamp the schedule next becomes due.
    pub next_rotation_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: ScheduleStatus,
    /// Last rotation error, if `status == Failed`.
    pub last_error: Option<String>,
}

/// A dynamically issued, time-bounded credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning org, if scoped to one.
    pub org_id: Option<Uuid>,
    /// Logical path describing what the lease grants (e.g. `database/app`).
    pub path: String,
    /// Lease kind (e.g. `database`).
    pub lease_type: String,
    /// Envelope-encrypted JSON credential bundle.
    pub wrapped_credential: Vec<u8>,
    /// Nonce for `wrapped_credential`.
    pub nonce: Vec<u8>,
    /// Sealed DEK for `wrapped_credential`.
    pub wrapped_dek: Vec<u8>,
    /// Nonce for `wrapped_dek`.
    pub wrapped_dek_nonce: Vec<u8>,
    /// Root key generation used.
    pub root_key_generation: i32,
    /// Subject that requested the lease.
    pub issuer: String,
    /// Issuance timestamp.
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,
    /// Revocation timestamp, if revoked.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Lease {
    /// Whether the lease currently grants access.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// Per-node logical clock used to reason about causality.
///
/// Serializes as a canonical (sorted) JSON object of node id to counter.
/// Components are always clamped to `>= 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, i64>);

impl VectorClock {
    /// An empty clock.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// The counter value for `node_id` (zero if absent).
    pub fn get(&self, node_id: &str) -> i64 {
        *self.0.get(node_id).unwrap_or(&0)
    }

    /// Bump `node_id`'s component by one, returning the new clock.
    pub fn increment(&self, node_id: &str) -> Self {
        let mut next = self.clone();
        let entry = next.0.entry(node_id.to_string()).or_insert(0);
        *entry = (*entry + 1).max(0);
        next
    }

    /// Componentwise max of `self` and `other`.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (node, count) in &other.0 {
            let entry = merged.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*count).max(0);
        }
        Self(merged)
    }

    /// `true` iff every component of `self` is `<=` the corresponding
    /// component of `other`, and at least one is strictly less. Missing
    /// components are treated as zero on both sides.
    pub fn happens_before(&self, other: &Self) -> bool {
        let mut strictly_less = false;
        for node in self.nodes().chain(other.nodes()) {
            let a = self.get(node);
            let b = other.get(node);
            if a > b {
                return false;
            }
            if a < b {
                strictly_less = true;
            }
        }
        strictly_less
    }

    /// `true` iff neither clock happens-before the other.
    pub fn concurrent(&self, other: &Self) -> bool {
        !self.happens_before(other) && !other.happens_before(self)
    }

    fn nodes(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|s| s.as_str())
    }
}

/// An append-only entry in a node's write-ahead replication log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEntry {
    /// Monotonic, per-node-assigned identifier used for `pull(after_id, ...)`.
    pub id: i64,
    /// Kind of mutation.
    pub op: ReplicationOp,
    /// Logical table name.
    pub table: String,
    /// Identifier of the affected row.
    pub row_id: String,
    /// JSON-encoded row payload.
    pub payload: serde_json::Value,
    /// Wall-clock timestamp recorded at append time.
    pub timestamp: DateTime<Utc>,
    /// Node that authored the entry.
    pub node_id: String,
    /// Vector clock snapshot taken at append time.
    pub vector_clock: VectorClock,
}

/// An outbound notification subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning org.
    pub org_id: Uuid,
    /// Delivery URL.
    pub url: String,
    /// Envelope-encrypted HMAC secret; plaintext is returned only once, at creation.
    pub wrapped_secret: Vec<u8>,
    /// Nonce for `wrapped_secret`.
    pub nonce: Vec<u8>,
    /// Sealed DEK for `wrapped_secret`.
    pub wrapped_dek: Vec<u8>,
    /// Nonce for `wrapped_dek`.
    pub wrapped_dek_nonce: Vec<u8>,
    /// Root key generation used.
    pub root_key_generation: i32,
    /// Event kinds this webhook is subscribed to.
    pub subscribed_events: Vec<String>,
    /// Whether deliveries are currently attempted.
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_clock_happens_before() {
        let a = VectorClock::new().increment("n1");
        let b = a.increment("n1").increment("n2");
        assert!(a.happens_before(&b));
        assert!(!b.happens_before(&a));
        assert!(!a.concurrent(&b));
    }

    #[test]
    fn vector_clock_concurrent() {
        let base = VectorClock::new().increment("n1");
        let a = base.increment("n1");
        let b = base.increment("n2");
        assert!(a.concurrent(&b));
        assert!(!a.happens_before(&b));
        assert!(!b.happens_before(&a));
    }

    #[test]
    fn vector_clock_merge_is_componentwise_max() {
        let a = VectorClock::new().increment("n1").increment("n1");
        let b = VectorClock::new().increment("n2");
        let merged = a.merge(&b);
        assert_eq!(merged.get("n1"), 2);
        assert_eq!(merged.get("n2"), 1);
    }

    #[test]
    fn service_account_scope_checks() {
        let sa = ServiceAccount {
            id: Uuid::new_v4(),
            name: "svc".into(),
            token_hash: "x".into(),
            project_id: Uuid::new_v4(),
            scopes: vec!["read".into()],
            created_by: "admin".into(),
            created_at: Utc::now(),
            expires_at: None,
        };
        assert!(sa.has_scope_for(Action::Read));
        assert!(!sa.has_scope_for(Action::Write));
    }

    #[test]
    fn lease_active_respects_revocation_and_expiry() {
        let now = Utc::now();
        let mut lease = Lease {
            id: Uuid::new_v4(),
            org_id: None,
            path: "database/app".into(),
            lease_type: "database".into(),
            wrapped_credential: vec![],
            nonce: vec![],
            wrapped_dek: vec![],
            wrapped_dek_nonce: vec![],
            root_key_generation: 1,
            issuer: "alice".into(),
            issued_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            revoked_at: None,
        };
        assert!(lease.is_active(now));
        lease.revoked_at = Some(now);
        assert!(!lease.is_active(now));
    }
}
