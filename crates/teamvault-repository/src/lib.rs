#![forbid(unsafe_code)]

//! The narrow persistence contract every other TeamVault component talks
//! to. No component other than implementations of [`Repository`] speaks
//! SQL directly.
//!
//! Two implementations are provided: [`pg::PgRepository`], backed by
//! Postgres via `sqlx`, and [`memory::MemoryRepository`], an in-process
//! double used by tests across the workspace.

pub mod error;
pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use error::RepositoryError;
use teamvault_types::{
    IamPolicy, Lease, Policy, Project, ReplicationEntry, RotationSchedule, Secret, SecretType,
    SecretVersion, ServiceAccount, SubjectType, User, Webhook,
};
use uuid::Uuid;

pub use pg::PgRepository;
pub use memory::MemoryRepository;

/// The envelope fields produced by `teamvault-crypto` for a single sealed
/// value, passed through to persistence without the repository needing to
/// depend on the crypto crate.
#[derive(Debug, Clone)]
pub struct EnvelopeFields {
    /// AEAD ciphertext.
    pub ciphertext: Vec<u8>,
    /// Nonce used for the ciphertext seal.
    pub nonce: Vec<u8>,
    /// The DEK, sealed under the root key.
    pub wrapped_dek: Vec<u8>,
    /// Nonce used for the DEK seal.
    pub wrapped_dek_nonce: Vec<u8>,
    /// Root key generation used.
    pub root_key_generation: i32,
}

/// The narrow, transactional persistence contract used by every other
/// TeamVault component.
#[async_trait]
pub trait Repository: Send + Sync {
    // ---- Projects -----------------------------------------------------

    /// Creates a project. Fails with `Conflict` if the name is taken.
    async fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        org_id: Option<Uuid>,
        created_by: &str,
    ) -> Result<Project, RepositoryError>;

    /// Looks up a project by its unique name.
    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>, RepositoryError>;

    /// Looks up a project by id.
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, RepositoryError>;

    // ---- Secrets & versions --------------------------------------------

    /// Creates the next version of the secret at `(project_id, path)`,
    /// creating the `Secret` row itself if this is the first write.
    ///
    /// Retries internally up to 3 times if a concurrent writer wins the
    /// race on `(secret_id, version)`; returns `Conflict` if all retries
    /// are exhausted.
    async fn put_secret_version(
        &self,
        project_id: Uuid,
        path: &str,
        secret_type: SecretType,
        envelope: EnvelopeFields,
        created_by: &str,
    ) -> Result<(Secret, SecretVersion), RepositoryError>;

    /// Looks up a non-deleted secret by `(project_id, path)`.
    async fn get_secret(&self, project_id: Uuid, path: &str) -> Result<Option<Secret>, RepositoryError>;

    /// Lists non-deleted secrets in a project.
    async fn list_secrets(&self, project_id: Uuid) -> Result<Vec<Secret>, RepositoryError>;

    /// Soft-deletes a secret. Returns `NotFound` if absent or already deleted.
    async fn soft_delete_secret(&self, project_id: Uuid, path: &str) -> Result<(), RepositoryError>;

    /// The most recent (highest-version) version of a secret.
    async fn get_latest_version(&self, secret_id: Uuid) -> Result<Option<SecretVersion>, RepositoryError>;

    /// All versions of a secret in ascending version order.
    async fn list_versions(&self, secret_id: Uuid) -> Result<Vec<SecretVersion>, RepositoryError>;

    /// Inserts the next version of an existing secret addressed by
    /// `secret_id` directly (used by the rotation scheduler, which only
    /// holds a secret id, not its `(project_id, path)`). Retries internally
    /// like [`Repository::put_secret_version`].
    async fn insert_rotated_version(
        &self,
        secret_id: Uuid,
        envelope: EnvelopeFields,
        created_by: &str,
    ) -> Result<SecretVersion, RepositoryError>;

    // ---- Users ----------------------------------------------------------

    /// Creates a user. Fails with `Conflict` if the email is taken.
    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        role: &str,
    ) -> Result<User, RepositoryError>;

    /// Looks up a user by login email.
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError>;

    // ---- Service accounts -------------------------------------------------

    /// Persists a newly issued service account (token already hashed).
    async fn create_service_account(&self, sa: ServiceAccount) -> Result<ServiceAccount, RepositoryError>;

    /// All service accounts not yet expired as of `now`. The caller (auth
    /// middleware) compares the bearer token against each one's hash.
    async fn list_active_service_accounts(&self, now: DateTime<Utc>) -> Result<Vec<ServiceAccount>, RepositoryError>;

    // ---- Policies ---------------------------------------------------------

    /// Legacy policies applicable to a subject: those with a matching
    /// `subject_type`/`subject_id`, plus any marked `SubjectType::Any`.
    async fn list_legacy_policies_for_subject(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
    ) -> Result<Vec<Policy>, RepositoryError>;

    /// IAM policies belonging to an org.
    async fn list_iam_policies_for_org(&self, org_id: Uuid) -> Result<Vec<IamPolicy>, RepositoryError>;

    /// Creates a legacy policy statement.
    async fn create_legacy_policy(&self, policy: Policy) -> Result<Policy, RepositoryError>;

    /// Creates an org-scoped IAM policy. Fails with `Conflict` if
    /// `(org_id, name)` is taken.
    async fn create_iam_policy(&self, policy: IamPolicy) -> Result<IamPolicy, RepositoryError>;

    // ---- Rotation schedules ------------------------------------------------

    /// Creates a rotation schedule. Fails with `Conflict` if `secret_id`
    /// already has another schedule with `status = Active` (spec.md §3:
    /// "at most one active schedule per secret").
    async fn create_rotation_schedule(&self, schedule: RotationSchedule) -> Result<RotationSchedule, RepositoryError>;

    /// Active schedules due at or before `now`, ordered by `next_rotation_at`
    /// ascending.
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<RotationSchedule>, RepositoryError>;

    /// Records a successful rotation.
    async fn record_rotation_success(
        &self,
        schedule_id: Uuid,
        last_rotated_at: DateTime<Utc>,
        next_rotation_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Marks a schedule `failed` with the given error.
    async fn record_rotation_failure(&self, schedule_id: Uuid, error: &str) -> Result<(), RepositoryError>;

    // ---- Leases -------------------------------------------------------------

    /// Persists a newly issued lease.
    async fn insert_lease(&self, lease: Lease) -> Result<Lease, RepositoryError>;

    /// Looks up a lease by id.
    async fn get_lease(&self, id: Uuid) -> Result<Option<Lease>, RepositoryError>;

    /// Leases that are currently active (not revoked, not expired).
    async fn list_active_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>, RepositoryError>;

    /// Revokes a lease if it is currently active. Returns `false` if it was
    /// already revoked or expired.
    async fn revoke_lease(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError>;

    /// Revokes every lease due to expire as of `now`; returns the count
    /// newly revoked.
    async fn expire_all_due_leases(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;

    // ---- Replication --------------------------------------------------------

    /// Appends an entry to this node's write-ahead log.
    async fn append_replication_entry(&self, entry: ReplicationEntry) -> Result<ReplicationEntry, RepositoryError>;

    /// Entries strictly after `after_id`, in insertion order, up to `limit`,
    /// plus whether more entries exist beyond the returned page.
    async fn pull_replication_entries(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<(Vec<ReplicationEntry>, bool), RepositoryError>;

    /// Entries for `(table, row_id)` recorded at or after `since`, used by
    /// the replication apply path to detect conflicting concurrent writes.
    async fn recent_entries_for_row(
        &self,
        table: &str,
        row_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReplicationEntry>, RepositoryError>;

    /// Inserts `entry` if no entry with the same id already exists
    /// (`ON CONFLICT DO NOTHING` semantics); returns whether it was inserted.
    async fn apply_replication_entry(&self, entry: ReplicationEntry) -> Result<bool, RepositoryError>;

    // ---- Webhooks -----------------------------------------------------------

    /// Persists a newly created webhook subscription.
    async fn create_webhook(&self, webhook: Webhook) -> Result<Webhook, RepositoryError>;

    /// Active webhooks for an org subscribed to `event`.
    async fn list_active_webhooks_for_org(&self, org_id: Uuid, event: &str) -> Result<Vec<Webhook>, RepositoryError>;
}
