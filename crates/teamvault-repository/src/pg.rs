//! Postgres-backed [`crate::Repository`] implementation.

use crate::error::RepositoryError;
use crate::{EnvelopeFields, Repository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use teamvault_types::{
    Effect, IamPolicy, IamPolicyType, Lease, Outcome, Policy, Project, ReplicationEntry,
    ReplicationOp, RotationSchedule, Secret, SecretType, SecretVersion, ScheduleStatus,
    ServiceAccount, SubjectType, User, VectorClock, Webhook,
};
use uuid::Uuid;

/// A `sqlx`-backed [`Repository`] talking to Postgres.
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    /// Connects to `database_url` with a small bounded pool.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(RepositoryError::from)?;
        Ok(Self { pool })
    }

    /// Wraps an already-constructed pool (e.g. shared with other components).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access to the underlying pool, e.g. for a [`crate::pg::PgAuditSink`].
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates every relation this crate needs if it does not already
    /// exist. Intentionally idempotent so it can run on every startup.
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS projects (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                org_id UUID,
                created_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS secrets (
                id UUID PRIMARY KEY,
                project_id UUID NOT NULL,
                path TEXT NOT NULL,
                secret_type TEXT NOT NULL,
                metadata JSONB,
                created_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                deleted_at TIMESTAMPTZ
            );
            CREATE UNIQUE INDEX IF NOT EXISTS secrets_project_path_unique
                ON secrets(project_id, path) WHERE deleted_at IS NULL;

            CREATE TABLE IF NOT EXISTS secret_versions (
                id UUID PRIMARY KEY,
                secret_id UUID NOT NULL,
                version BIGINT NOT NULL,
                ciphertext BYTEA NOT NULL,
                nonce BYTEA NOT NULL,
                wrapped_dek BYTEA NOT NULL,
                wrapped_dek_nonce BYTEA NOT NULL,
                root_key_generation INT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (secret_id, version)
            );

            CREATE TABLE IF NOT EXISTS service_accounts (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                token_hash TEXT NOT NULL,
                project_id UUID NOT NULL,
                scopes TEXT[] NOT NULL,
                created_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ
            );

            CREATE TABLE IF NOT EXISTS policies (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                effect TEXT NOT NULL,
                actions TEXT[] NOT NULL,
                resource_pattern TEXT NOT NULL,
                subject_type TEXT NOT NULL,
                subject_id TEXT,
                conditions JSONB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS iam_policies (
                id UUID PRIMARY KEY,
                org_id UUID NOT NULL,
                name TEXT NOT NULL,
                policy_type TEXT NOT NULL,
                document JSONB NOT NULL,
                hcl_source TEXT,
                UNIQUE (org_id, name)
            );

            CREATE TABLE IF NOT EXISTS orgs (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS teams (
                id UUID PRIMARY KEY,
                org_id UUID NOT NULL,
                name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS team_members (
                id UUID PRIMARY KEY,
                team_id UUID NOT NULL,
                user_id UUID NOT NULL,
                role TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id UUID PRIMARY KEY,
                team_id UUID NOT NULL,
                name TEXT NOT NULL,
                token_hash TEXT NOT NULL,
                scopes TEXT[] NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rotation_schedules (
                id UUID PRIMARY KEY,
                secret_id UUID NOT NULL,
                schedule_expr TEXT NOT NULL,
                connector_type TEXT NOT NULL,
                connector_config JSONB NOT NULL,
                last_rotated_at TIMESTAMPTZ,
                next_rotation_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS rotation_schedules_one_active_per_secret
                ON rotation_schedules(secret_id) WHERE status = 'active';

            CREATE TABLE IF NOT EXISTS leases (
                id UUID PRIMARY KEY,
                org_id UUID,
                path TEXT NOT NULL,
                lease_type TEXT NOT NULL,
                wrapped_credential BYTEA NOT NULL,
                nonce BYTEA NOT NULL,
                wrapped_dek BYTEA NOT NULL,
                wrapped_dek_nonce BYTEA NOT NULL,
                root_key_generation INT NOT NULL,
                issuer TEXT NOT NULL,
                issued_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                revoked_at TIMESTAMPTZ
            );

            CREATE TABLE IF NOT EXISTS webhooks (
                id UUID PRIMARY KEY,
                org_id UUID NOT NULL,
                url TEXT NOT NULL,
                wrapped_secret BYTEA NOT NULL,
                nonce BYTEA NOT NULL,
                wrapped_dek BYTEA NOT NULL,
                wrapped_dek_nonce BYTEA NOT NULL,
                root_key_generation INT NOT NULL,
                subscribed_events TEXT[] NOT NULL,
                active BOOLEAN NOT NULL
            );

            CREATE TABLE IF NOT EXISTS replication_log (
                seq BIGSERIAL PRIMARY KEY,
                op TEXT NOT NULL,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                node_id TEXT NOT NULL,
                vector_clock JSONB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_events (
                seq BIGSERIAL PRIMARY KEY,
                id UUID NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                actor_type TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                action TEXT NOT NULL,
                resource TEXT NOT NULL,
                outcome TEXT NOT NULL,
                ip TEXT,
                metadata TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                hash TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }
}

fn secret_type_str(t: SecretType) -> &'static str {
    match t {
        SecretType::Kv => "kv",
        SecretType::Json => "json",
        SecretType::File => "file",
    }
}

fn parse_secret_type(s: &str) -> SecretType {
    match s {
        "json" => SecretType::Json,
        "file" => SecretType::File,
        _ => SecretType::Kv,
    }
}

fn row_to_secret(row: &sqlx::postgres::PgRow) -> Secret {
    Secret {
        id: row.get("id"),
        project_id: row.get("project_id"),
        path: row.get("path"),
        secret_type: parse_secret_type(row.get::<String, _>("secret_type").as_str()),
        metadata: row.get("metadata"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    }
}

fn row_to_version(row: &sqlx::postgres::PgRow) -> SecretVersion {
    SecretVersion {
        id: row.get("id"),
        secret_id: row.get("secret_id"),
        version: row.get("version"),
        ciphertext: row.get("ciphertext"),
        nonce: row.get("nonce"),
        wrapped_dek: row.get("wrapped_dek"),
        wrapped_dek_nonce: row.get("wrapped_dek_nonce"),
        root_key_generation: row.get("root_key_generation"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        org_id: Option<Uuid>,
        created_by: &str,
    ) -> Result<Project, RepositoryError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO projects (id, name, description, org_id, created_by, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(name)
        .bind(description)
        .bind(org_id)
        .bind(created_by)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Project {
            id,
            name: name.to_string(),
            description: description.map(str::to_string),
            org_id,
            created_by: created_by.to_string(),
            created_at: now,
        })
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM projects WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Project {
            id: r.get("id"),
            name: r.get("name"),
            description: r.get("description"),
            org_id: r.get("org_id"),
            created_by: r.get("created_by"),
            created_at: r.get("created_at"),
        }))
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Project {
            id: r.get("id"),
            name: r.get("name"),
            description: r.get("description"),
            org_id: r.get("org_id"),
            created_by: r.get("created_by"),
            created_at: r.get("created_at"),
        }))
    }

    async fn put_secret_version(
        &self,
        project_id: Uuid,
        path: &str,
        secret_type: SecretType,
        envelope: EnvelopeFields,
        created_by: &str,
    ) -> Result<(Secret, SecretVersion), RepositoryError> {
        const MAX_RETRIES: u32 = 3;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .try_put_secret_version(project_id, path, secret_type, &envelope, created_by)
                .await
            {
                Ok(result) => return Ok(result),
                Err(RepositoryError::Conflict(msg)) if attempt < MAX_RETRIES => {
                    tracing::warn!(attempt, %msg, "secret version write raced, retrying");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn get_secret(&self, project_id: Uuid, path: &str) -> Result<Option<Secret>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM secrets WHERE project_id = $1 AND path = $2 AND deleted_at IS NULL",
        )
        .bind(project_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_secret))
    }

    async fn list_secrets(&self, project_id: Uuid) -> Result<Vec<Secret>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM secrets WHERE project_id = $1 AND deleted_at IS NULL ORDER BY path",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_secret).collect())
    }

    async fn soft_delete_secret(&self, project_id: Uuid, path: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE secrets SET deleted_at = $1, updated_at = $1 WHERE project_id = $2 AND path = $3 AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(project_id)
        .bind(path)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_latest_version(&self, secret_id: Uuid) -> Result<Option<SecretVersion>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM secret_versions WHERE secret_id = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(secret_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_version))
    }

    async fn list_versions(&self, secret_id: Uuid) -> Result<Vec<SecretVersion>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM secret_versions WHERE secret_id = $1 ORDER BY version ASC",
        )
        .bind(secret_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_version).collect())
    }

    async fn insert_rotated_version(
        &self,
        secret_id: Uuid,
        envelope: EnvelopeFields,
        created_by: &str,
    ) -> Result<SecretVersion, RepositoryError> {
        const MAX_RETRIES: u32 = 3;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_insert_rotated_version(secret_id, &envelope, created_by).await {
                Ok(version) => return Ok(version),
                Err(RepositoryError::Conflict(msg)) if attempt < MAX_RETRIES => {
                    tracing::warn!(attempt, %msg, "rotated version write raced, retrying");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn create_user(&self, email: &str, password_hash: &str, role: &str) -> Result<User, RepositoryError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, role, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(email)
        .bind(password_hash)
        .bind(role)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(User {
            id,
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            role: role.to_string(),
            created_at: now,
        })
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| User {
            id: r.get("id"),
            email: r.get("email"),
            password_hash: r.get("password_hash"),
            role: r.get("role"),
            created_at: r.get("created_at"),
        }))
    }

    async fn create_service_account(&self, sa: ServiceAccount) -> Result<ServiceAccount, RepositoryError> {
        sqlx::query(
            "INSERT INTO service_accounts (id, name, token_hash, project_id, scopes, created_by, created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(sa.id)
        .bind(&sa.name)
        .bind(&sa.token_hash)
        .bind(sa.project_id)
        .bind(&sa.scopes)
        .bind(&sa.created_by)
        .bind(sa.created_at)
        .bind(sa.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(sa)
    }

    async fn list_active_service_accounts(&self, now: DateTime<Utc>) -> Result<Vec<ServiceAccount>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM service_accounts WHERE expires_at IS NULL OR expires_at > $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ServiceAccount {
                id: r.get("id"),
                name: r.get("name"),
                token_hash: r.get("token_hash"),
                project_id: r.get("project_id"),
                scopes: r.get("scopes"),
                created_by: r.get("created_by"),
                created_at: r.get("created_at"),
                expires_at: r.get("expires_at"),
            })
            .collect())
    }

    async fn list_legacy_policies_for_subject(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
    ) -> Result<Vec<Policy>, RepositoryError> {
        let subject_type_str = match subject_type {
            SubjectType::User => "user",
            SubjectType::ServiceAccount => "service_account",
            SubjectType::Any => "any",
        };
        let rows = sqlx::query(
            "SELECT * FROM policies WHERE (subject_type = $1 AND (subject_id = $2 OR subject_id IS NULL)) OR subject_type = 'any'",
        )
        .bind(subject_type_str)
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| Policy {
                id: r.get("id"),
                name: r.get("name"),
                effect: if r.get::<String, _>("effect") == "deny" {
                    Effect::Deny
                } else {
                    Effect::Allow
                },
                actions: r.get("actions"),
                resource_pattern: r.get("resource_pattern"),
                subject_type: match r.get::<String, _>("subject_type").as_str() {
                    "service_account" => SubjectType::ServiceAccount,
                    "any" => SubjectType::Any,
                    _ => SubjectType::User,
                },
                subject_id: r.get("subject_id"),
                conditions: serde_json::from_value(r.get("conditions")).unwrap_or_default(),
            })
            .collect())
    }

    async fn list_iam_policies_for_org(&self, org_id: Uuid) -> Result<Vec<IamPolicy>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM iam_policies WHERE org_id = $1")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| IamPolicy {
                id: r.get("id"),
                org_id: r.get("org_id"),
                name: r.get("name"),
                policy_type: match r.get::<String, _>("policy_type").as_str() {
                    "abac" => IamPolicyType::Abac,
                    "pbac" => IamPolicyType::Pbac,
                    _ => IamPolicyType::Rbac,
                },
                document: r.get("document"),
                hcl_source: r.get("hcl_source"),
            })
            .collect())
    }

    async fn create_legacy_policy(&self, policy: Policy) -> Result<Policy, RepositoryError> {
        let effect_str = match policy.effect {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        };
        let subject_type_str = match policy.subject_type {
            SubjectType::User => "user",
            SubjectType::ServiceAccount => "service_account",
            SubjectType::Any => "any",
        };
        sqlx::query(
            "INSERT INTO policies (id, name, effect, actions, resource_pattern, subject_type, subject_id, conditions)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(policy.id)
        .bind(&policy.name)
        .bind(effect_str)
        .bind(&policy.actions)
        .bind(&policy.resource_pattern)
        .bind(subject_type_str)
        .bind(&policy.subject_id)
        .bind(serde_json::to_value(&policy.conditions).unwrap_or_default())
        .execute(&self.pool)
        .await?;
        Ok(policy)
    }

    async fn create_iam_policy(&self, policy: IamPolicy) -> Result<IamPolicy, RepositoryError> {
        let policy_type_str = match policy.policy_type {
            IamPolicyType::Rbac => "rbac",
            IamPolicyType::Abac => "abac",
            IamPolicyType::Pbac => "pbac",
        };
        sqlx::query(
            "INSERT INTO iam_policies (id, org_id, name, policy_type, document, hcl_source)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(policy.id)
        .bind(policy.org_id)
        .bind(&policy.name)
        .bind(policy_type_str)
        .bind(&policy.document)
        .bind(&policy.hcl_source)
        .execute(&self.pool)
        .await?;
        Ok(policy)
    }

    async fn create_rotation_schedule(&self, schedule: RotationSchedule) -> Result<RotationSchedule, RepositoryError> {
        sqlx::query(
            "INSERT INTO rotation_schedules
                (id, secret_id, schedule_expr, connector_type, connector_config, last_rotated_at, next_rotation_at, status, last_error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(schedule.id)
        .bind(schedule.secret_id)
        .bind(&schedule.schedule_expr)
        .bind(&schedule.connector_type)
        .bind(&schedule.connector_config)
        .bind(schedule.last_rotated_at)
        .bind(schedule.next_rotation_at)
        .bind("active")
        .bind(&schedule.last_error)
        .execute(&self.pool)
        .await?;
        Ok(schedule)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<RotationSchedule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM rotation_schedules WHERE status = 'active' AND next_rotation_at <= $1 ORDER BY next_rotation_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| RotationSchedule {
                id: r.get("id"),
                secret_id: r.get("secret_id"),
                schedule_expr: r.get("schedule_expr"),
                connector_type: r.get("connector_type"),
                connector_config: r.get("connector_config"),
                last_rotated_at: r.get("last_rotated_at"),
                next_rotation_at: r.get("next_rotation_at"),
                status: if r.get::<String, _>("status") == "failed" {
                    ScheduleStatus::Failed
                } else {
                    ScheduleStatus::Active
                },
                last_error: r.get("last_error"),
            })
            .collect())
    }

    async fn record_rotation_success(
        &self,
        schedule_id: Uuid,
        last_rotated_at: DateTime<Utc>,
        next_rotation_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE rotation_schedules SET last_rotated_at = $1, next_rotation_at = $2, status = 'active', last_error = NULL WHERE id = $3",
        )
        .bind(last_rotated_at)
        .bind(next_rotation_at)
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_rotation_failure(&self, schedule_id: Uuid, error: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE rotation_schedules SET status = 'failed', last_error = $1 WHERE id = $2")
            .bind(error)
            .bind(schedule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_lease(&self, lease: Lease) -> Result<Lease, RepositoryError> {
        sqlx::query(
            "INSERT INTO leases
                (id, org_id, path, lease_type, wrapped_credential, nonce, wrapped_dek, wrapped_dek_nonce, root_key_generation, issuer, issued_at, expires_at, revoked_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(lease.id)
        .bind(lease.org_id)
        .bind(&lease.path)
        .bind(&lease.lease_type)
        .bind(&lease.wrapped_credential)
        .bind(&lease.nonce)
        .bind(&lease.wrapped_dek)
        .bind(&lease.wrapped_dek_nonce)
        .bind(lease.root_key_generation)
        .bind(&lease.issuer)
        .bind(lease.issued_at)
        .bind(lease.expires_at)
        .bind(lease.revoked_at)
        .execute(&self.pool)
        .await?;
        Ok(lease)
    }

    async fn get_lease(&self, id: Uuid) -> Result<Option<Lease>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM leases WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Lease {
            id: r.get("id"),
            org_id: r.get("org_id"),
            path: r.get("path"),
            lease_type: r.get("lease_type"),
            wrapped_credential: r.get("wrapped_credential"),
            nonce: r.get("nonce"),
            wrapped_dek: r.get("wrapped_dek"),
            wrapped_dek_nonce: r.get("wrapped_dek_nonce"),
            root_key_generation: r.get("root_key_generation"),
            issuer: r.get("issuer"),
            issued_at: r.get("issued_at"),
            expires_at: r.get("expires_at"),
            revoked_at: r.get("revoked_at"),
        }))
    }

    async fn list_active_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM leases WHERE revoked_at IS NULL AND expires_at > $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| Lease {
                id: r.get("id"),
                org_id: r.get("org_id"),
                path: r.get("path"),
                lease_type: r.get("lease_type"),
                wrapped_credential: r.get("wrapped_credential"),
                nonce: r.get("nonce"),
                wrapped_dek: r.get("wrapped_dek"),
                wrapped_dek_nonce: r.get("wrapped_dek_nonce"),
                root_key_generation: r.get("root_key_generation"),
                issuer: r.get("issuer"),
                issued_at: r.get("issued_at"),
                expires_at: r.get("expires_at"),
                revoked_at: r.get("revoked_at"),
            })
            .collect())
    }

    async fn revoke_lease(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE leases SET revoked_at = $1 WHERE id = $2 AND revoked_at IS NULL AND expires_at > $1",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_all_due_leases(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE leases SET revoked_at = $1 WHERE revoked_at IS NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_replication_entry(&self, entry: ReplicationEntry) -> Result<ReplicationEntry, RepositoryError> {
        let op_str = match entry.op {
            ReplicationOp::Insert => "INSERT",
            ReplicationOp::Update => "UPDATE",
            ReplicationOp::Delete => "DELETE",
        };
        let vector_clock_json = serde_json::to_value(&entry.vector_clock).unwrap_or_default();
        let row = sqlx::query(
            "INSERT INTO replication_log (op, table_name, row_id, payload, ts, node_id, vector_clock)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING seq",
        )
        .bind(op_str)
        .bind(&entry.table)
        .bind(&entry.row_id)
        .bind(&entry.payload)
        .bind(entry.timestamp)
        .bind(&entry.node_id)
        .bind(&vector_clock_json)
        .fetch_one(&self.pool)
        .await?;
        let seq: i64 = row.get("seq");
        Ok(ReplicationEntry { id: seq, ..entry })
    }

    async fn pull_replication_entries(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<(Vec<ReplicationEntry>, bool), RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM replication_log WHERE seq > $1 ORDER BY seq ASC LIMIT $2",
        )
        .bind(after_id)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;
        let has_more = rows.len() as i64 > limit;
        let entries = rows
            .into_iter()
            .take(limit as usize)
            .map(row_to_replication_entry)
            .collect();
        Ok((entries, has_more))
    }

    async fn recent_entries_for_row(
        &self,
        table: &str,
        row_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReplicationEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM replication_log WHERE table_name = $1 AND row_id = $2 AND ts >= $3 ORDER BY seq ASC",
        )
        .bind(table)
        .bind(row_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_replication_entry).collect())
    }

    async fn apply_replication_entry(&self, entry: ReplicationEntry) -> Result<bool, RepositoryError> {
        let op_str = match entry.op {
            ReplicationOp::Insert => "INSERT",
            ReplicationOp::Update => "UPDATE",
            ReplicationOp::Delete => "DELETE",
        };
        let vector_clock_json = serde_json::to_value(&entry.vector_clock).unwrap_or_default();
        let result = sqlx::query(
            "INSERT INTO replication_log (seq, op, table_name, row_id, payload, ts, node_id, vector_clock)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (seq) DO NOTHING",
        )
        .bind(entry.id)
        .bind(op_str)
        .bind(&entry.table)
        .bind(&entry.row_id)
        .bind(&entry.payload)
        .bind(entry.timestamp)
        .bind(&entry.node_id)
        .bind(&vector_clock_json)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_webhook(&self, webhook: Webhook) -> Result<Webhook, RepositoryError> {
        sqlx::query(
            "INSERT INTO webhooks
                (id, org_id, url, wrapped_secret, nonce, wrapped_dek, wrapped_dek_nonce, root_key_generation, subscribed_events, active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(webhook.id)
        .bind(webhook.org_id)
        .bind(&webhook.url)
        .bind(&webhook.wrapped_secret)
        .bind(&webhook.nonce)
        .bind(&webhook.wrapped_dek)
        .bind(&webhook.wrapped_dek_nonce)
        .bind(webhook.root_key_generation)
        .bind(&webhook.subscribed_events)
        .bind(webhook.active)
        .execute(&self.pool)
        .await?;
        Ok(webhook)
    }

    async fn list_active_webhooks_for_org(&self, org_id: Uuid, event: &str) -> Result<Vec<Webhook>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM webhooks WHERE org_id = $1 AND active = true AND $2 = ANY(subscribed_events)",
        )
        .bind(org_id)
        .bind(event)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| Webhook {
                id: r.get("id"),
                org_id: r.get("org_id"),
                url: r.get("url"),
                wrapped_secret: r.get("wrapped_secret"),
                nonce: r.get("nonce"),
                wrapped_dek: r.get("wrapped_dek"),
                wrapped_dek_nonce: r.get("wrapped_dek_nonce"),
                root_key_generation: r.get("root_key_generation"),
                subscribed_events: r.get("subscribed_events"),
                active: r.get("active"),
            })
            .collect())
    }
}

fn row_to_replication_entry(row: sqlx::postgres::PgRow) -> ReplicationEntry {
    let op = match row.get::<String, _>("op").as_str() {
        "UPDATE" => ReplicationOp::Update,
        "DELETE" => ReplicationOp::Delete,
        _ => ReplicationOp::Insert,
    };
    let vector_clock: VectorClock = serde_json::from_value(row.get("vector_clock")).unwrap_or_default();
    ReplicationEntry {
        id: row.get("seq"),
        op,
        table: row.get("table_name"),
        row_id: row.get("row_id"),
        payload: row.get("payload"),
        timestamp: row.get("ts"),
        node_id: row.get("node_id"),
        vector_clock,
    }
}

impl PgRepository {
    async fn try_put_secret_version(
        &self,
        project_id: Uuid,
        path: &str,
        secret_type: SecretType,
        envelope: &EnvelopeFields,
        created_by: &str,
    ) -> Result<(Secret, SecretVersion), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let existing = sqlx::query(
            "SELECT * FROM secrets WHERE project_id = $1 AND path = $2 AND deleted_at IS NULL",
        )
        .bind(project_id)
        .bind(path)
        .fetch_optional(&mut *tx)
        .await?;

        let secret = if let Some(row) = existing {
            sqlx::query("UPDATE secrets SET updated_at = $1 WHERE id = $2")
                .bind(now)
                .bind(row.get::<Uuid, _>("id"))
                .execute(&mut *tx)
                .await?;
            let mut secret = row_to_secret(&row);
            secret.updated_at = now;
            secret
        } else {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO secrets (id, project_id, path, secret_type, metadata, created_by, created_at, updated_at, deleted_at)
                 VALUES ($1, $2, $3, $4, NULL, $5, $6, $6, NULL)",
            )
            .bind(id)
            .bind(project_id)
            .bind(path)
            .bind(secret_type_str(secret_type))
            .bind(created_by)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            Secret {
                id,
                project_id,
                path: path.to_string(),
                secret_type,
                metadata: None,
                created_by: created_by.to_string(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
            }
        };

        let latest_version: Option<i64> = sqlx::query(
            "SELECT version FROM secret_versions WHERE secret_id = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(secret.id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| r.get("version"));

        let next_version = latest_version.unwrap_or(0) + 1;
        let version_id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO secret_versions
                (id, secret_id, version, ciphertext, nonce, wrapped_dek, wrapped_dek_nonce, root_key_generation, created_by, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(version_id)
        .bind(secret.id)
        .bind(next_version)
        .bind(&envelope.ciphertext)
        .bind(&envelope.nonce)
        .bind(&envelope.wrapped_dek)
        .bind(&envelope.wrapped_dek_nonce)
        .bind(envelope.root_key_generation)
        .bind(created_by)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((
            secret,
            SecretVersion {
                id: version_id,
                secret_id: secret.id,
                version: next_version,
                ciphertext: envelope.ciphertext.clone(),
                nonce: envelope.nonce.clone(),
                wrapped_dek: envelope.wrapped_dek.clone(),
                wrapped_dek_nonce: envelope.wrapped_dek_nonce.clone(),
                root_key_generation: envelope.root_key_generation,
                created_by: created_by.to_string(),
                created_at: now,
            },
        ))
    }

    async fn try_insert_rotated_version(
        &self,
        secret_id: Uuid,
        envelope: &EnvelopeFields,
        created_by: &str,
    ) -> Result<SecretVersion, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let exists = sqlx::query("SELECT id FROM secrets WHERE id = $1")
            .bind(secret_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(RepositoryError::NotFound);
        }

        let latest_version: Option<i64> = sqlx::query(
            "SELECT version FROM secret_versions WHERE secret_id = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(secret_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| r.get("version"));

        let next_version = latest_version.unwrap_or(0) + 1;
        let version_id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO secret_versions
                (id, secret_id, version, ciphertext, nonce, wrapped_dek, wrapped_dek_nonce, root_key_generation, created_by, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(version_id)
        .bind(secret_id)
        .bind(next_version)
        .bind(&envelope.ciphertext)
        .bind(&envelope.nonce)
        .bind(&envelope.wrapped_dek)
        .bind(&envelope.wrapped_dek_nonce)
        .bind(envelope.root_key_generation)
        .bind(created_by)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE secrets SET updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(secret_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(SecretVersion {
            id: version_id,
            secret_id,
            version: next_version,
            ciphertext: envelope.ciphertext.clone(),
            nonce: envelope.nonce.clone(),
            wrapped_dek: envelope.wrapped_dek.clone(),
            wrapped_dek_nonce: envelope.wrapped_dek_nonce.clone(),
            root_key_generation: envelope.root_key_generation,
            created_by: created_by.to_string(),
            created_at: now,
        })
    }
}

/// An [`teamvault_audit::AuditSink`] that persists events into the
/// `audit_events` relation via the same pool as the rest of the repository.
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    /// Wraps a pool already migrated by [`PgRepository::migrate`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl teamvault_audit::AuditSink for PgAuditSink {
    async fn append(&self, event: teamvault_types::AuditEvent) -> Result<(), teamvault_audit::AuditError> {
        let outcome_str = match event.outcome {
            Outcome::Success => "success",
            Outcome::Denied => "denied",
            Outcome::Error => "error",
        };
        sqlx::query(
            "INSERT INTO audit_events (id, ts, actor_type, actor_id, action, resource, outcome, ip, metadata, prev_hash, hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(event.id)
        .bind(event.timestamp)
        .bind(&event.actor_type)
        .bind(&event.actor_id)
        .bind(&event.action)
        .bind(&event.resource)
        .bind(outcome_str)
        .bind(&event.ip)
        .bind(&event.metadata)
        .bind(&event.prev_hash)
        .bind(&event.hash)
        .execute(&self.pool)
        .await
        .map_err(|e| teamvault_audit::AuditError::SinkFailed(e.to_string()))?;
        Ok(())
    }

    async fn last_hash(&self) -> Result<String, teamvault_audit::AuditError> {
        let row = sqlx::query("SELECT hash FROM audit_events ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| teamvault_audit::AuditError::SinkFailed(e.to_string()))?;
        Ok(row.map(|r| r.get::<String, _>("hash")).unwrap_or_default())
    }
}

fn row_to_audit_event(row: sqlx::postgres::PgRow) -> teamvault_types::AuditEvent {
    let outcome_str: String = row.get("outcome");
    teamvault_types::AuditEvent {
        id: row.get("id"),
        timestamp: row.get("ts"),
        actor_type: row.get("actor_type"),
        actor_id: row.get("actor_id"),
        action: row.get("action"),
        resource: row.get("resource"),
        outcome: match outcome_str.as_str() {
            "success" => Outcome::Success,
            "denied" => Outcome::Denied,
            _ => Outcome::Error,
        },
        ip: row.get("ip"),
        metadata: row.get("metadata"),
        prev_hash: row.get("prev_hash"),
        hash: row.get("hash"),
    }
}

#[async_trait]
impl teamvault_audit::AuditQuery for PgAuditSink {
    async fn query(&self, filter: teamvault_audit::AuditQueryFilter) -> Result<Vec<teamvault_types::AuditEvent>, teamvault_audit::AuditError> {
        let mut sql = String::from(
            "SELECT id, ts, actor_type, actor_id, action, resource, outcome, ip, metadata, prev_hash, hash
             FROM audit_events WHERE 1=1",
        );
        let mut bind_idx = 1;
        if filter.actor_type.is_some() {
            sql.push_str(&format!(" AND actor_type = ${bind_idx}"));
            bind_idx += 1;
        }
        if filter.actor_id.is_some() {
            sql.push_str(&format!(" AND actor_id = ${bind_idx}"));
            bind_idx += 1;
        }
        if filter.action.is_some() {
            sql.push_str(&format!(" AND action = ${bind_idx}"));
            bind_idx += 1;
        }
        if filter.resource.is_some() {
            sql.push_str(&format!(" AND resource = ${bind_idx}"));
            bind_idx += 1;
        }
        sql.push_str(&format!(" ORDER BY seq DESC LIMIT ${bind_idx} OFFSET ${}", bind_idx + 1));

        let mut query = sqlx::query(&sql);
        if let Some(v) = &filter.actor_type {
            query = query.bind(v);
        }
        if let Some(v) = &filter.actor_id {
            query = query.bind(v);
        }
        if let Some(v) = &filter.action {
            query = query.bind(v);
        }
        if let Some(v) = &filter.resource {
            query = query.bind(v);
        }
        query = query.bind(filter.limit).bind(filter.offset);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| teamvault_audit::AuditError::SinkFailed(e.to_string()))?;
        Ok(rows.into_iter().map(row_to_audit_event).collect())
    }
}

