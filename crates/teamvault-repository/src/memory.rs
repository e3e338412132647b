//! An in-process [`crate::Repository`] double used by tests across the
//! workspace. Not durable, not transactional in the SQL sense — guarded by
//! a single `tokio::sync::Mutex` so concurrent callers still observe
//! sequential, race-free semantics.

use crate::error::RepositoryError;
use crate::{EnvelopeFields, Repository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use teamvault_types::{
    IamPolicy, Lease, Policy, Project, ReplicationEntry, RotationSchedule, Secret, SecretType,
    SecretVersion, ScheduleStatus, ServiceAccount, SubjectType, User, Webhook,
};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    projects: HashMap<Uuid, Project>,
    secrets: HashMap<Uuid, Secret>,
    versions: HashMap<Uuid, Vec<SecretVersion>>,
    users: HashMap<Uuid, User>,
    service_accounts: HashMap<Uuid, ServiceAccount>,
    policies: Vec<Policy>,
    iam_policies: Vec<IamPolicy>,
    rotation_schedules: HashMap<Uuid, RotationSchedule>,
    leases: HashMap<Uuid, Lease>,
    replication_log: Vec<ReplicationEntry>,
    webhooks: HashMap<Uuid, Webhook>,
    next_replication_id: i64,
}

/// An in-memory [`Repository`] suitable for unit and integration tests.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        org_id: Option<Uuid>,
        created_by: &str,
    ) -> Result<Project, RepositoryError> {
        let mut state = self.state.lock().await;
        if state.projects.values().any(|p| p.name == name) {
            return Err(RepositoryError::Conflict(format!("project {name} already exists")));
        }
        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.map(str::to_string),
            org_id,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        };
        state.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.projects.values().find(|p| p.name == name).cloned())
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.projects.get(&id).cloned())
    }

    async fn put_secret_version(
        &self,
        project_id: Uuid,
        path: &str,
        secret_type: SecretType,
        envelope: EnvelopeFields,
        created_by: &str,
    ) -> Result<(Secret, SecretVersion), RepositoryError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let secret_id = state
            .secrets
            .values()
            .find(|s| s.project_id == project_id && s.path == path && s.deleted_at.is_none())
            .map(|s| s.id);

        let secret = if let Some(id) = secret_id {
            let secret = state.secrets.get_mut(&id).expect("looked up by id");
            secret.updated_at = now;
            secret.clone()
        } else {
            let secret = Secret {
                id: Uuid::new_v4(),
                project_id,
                path: path.to_string(),
                secret_type,
                metadata: None,
                created_by: created_by.to_string(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            state.secrets.insert(secret.id, secret.clone());
            secret
        };

        let versions = state.versions.entry(secret.id).or_default();
        let next_version = versions.last().map(|v| v.version).unwrap_or(0) + 1;
        let version = SecretVersion {
            id: Uuid::new_v4(),
            secret_id: secret.id,
            version: next_version,
            ciphertext: envelope.ciphertext,
            nonce: envelope.nonce,
            wrapped_dek: envelope.wrapped_dek,
            wrapped_dek_nonce: envelope.wrapped_dek_nonce,
            root_key_generation: envelope.root_key_generation,
            created_by: created_by.to_string(),
            created_at: now,
        };
        versions.push(version.clone());

        Ok((secret, version))
    }

    async fn get_secret(&self, project_id: Uuid, path: &str) -> Result<Option<Secret>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .secrets
            .values()
            .find(|s| s.project_id == project_id && s.path == path && s.deleted_at.is_none())
            .cloned())
    }

    async fn list_secrets(&self, project_id: Uuid) -> Result<Vec<Secret>, RepositoryError> {
        let state = self.state.lock().await;
        let mut secrets: Vec<Secret> = state
            .secrets
            .values()
            .filter(|s| s.project_id == project_id && s.deleted_at.is_none())
            .cloned()
            .collect();
        secrets.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(secrets)
    }

    async fn soft_delete_secret(&self, project_id: Uuid, path: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let target = state
            .secrets
            .values_mut()
            .find(|s| s.project_id == project_id && s.path == path && s.deleted_at.is_none());
        match target {
            Some(secret) => {
                secret.deleted_at = Some(now);
                secret.updated_at = now;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_latest_version(&self, secret_id: Uuid) -> Result<Option<SecretVersion>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.versions.get(&secret_id).and_then(|v| v.last().cloned()))
    }

    async fn list_versions(&self, secret_id: Uuid) -> Result<Vec<SecretVersion>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.versions.get(&secret_id).cloned().unwrap_or_default())
    }

    async fn insert_rotated_version(
        &self,
        secret_id: Uuid,
        envelope: EnvelopeFields,
        created_by: &str,
    ) -> Result<SecretVersion, RepositoryError> {
        let mut state = self.state.lock().await;
        if !state.secrets.contains_key(&secret_id) {
            return Err(RepositoryError::NotFound);
        }
        let now = Utc::now();
        let versions = state.versions.entry(secret_id).or_default();
        let next_version = versions.last().map(|v| v.version).unwrap_or(0) + 1;
        let version = SecretVersion {
            id: Uuid::new_v4(),
            secret_id,
            version: next_version,
            ciphertext: envelope.ciphertext,
            nonce: envelope.nonce,
            wrapped_dek: envelope.wrapped_dek,
            wrapped_dek_nonce: envelope.wrapped_dek_nonce,
            root_key_generation: envelope.root_key_generation,
            created_by: created_by.to_string(),
            created_at: now,
        };
        versions.push(version.clone());
        if let Some(secret) = state.secrets.get_mut(&secret_id) {
            secret.updated_at = now;
        }
        Ok(version)
    }

    async fn create_user(&self, email: &str, password_hash: &str, role: &str) -> Result<User, RepositoryError> {
        let mut state = self.state.lock().await;
        if state.users.values().any(|u| u.email == email) {
            return Err(RepositoryError::Conflict(format!("user {email} already exists")));
        }
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            role: role.to_string(),
            created_at: Utc::now(),
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }

    async fn create_service_account(&self, sa: ServiceAccount) -> Result<ServiceAccount, RepositoryError> {
        let mut state = self.state.lock().await;
        state.service_accounts.insert(sa.id, sa.clone());
        Ok(sa)
    }

    async fn list_active_service_accounts(&self, now: DateTime<Utc>) -> Result<Vec<ServiceAccount>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .service_accounts
            .values()
            .filter(|sa| sa.is_active(now))
            .cloned()
            .collect())
    }

    async fn list_legacy_policies_for_subject(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
    ) -> Result<Vec<Policy>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .policies
            .iter()
            .filter(|p| {
                p.subject_type == SubjectType::Any
                    || (p.subject_type == subject_type
                        && p.subject_id.as_deref().map_or(true, |id| id == subject_id))
            })
            .cloned()
            .collect())
    }

    async fn list_iam_policies_for_org(&self, org_id: Uuid) -> Result<Vec<IamPolicy>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.iam_policies.iter().filter(|p| p.org_id == org_id).cloned().collect())
    }

    async fn create_legacy_policy(&self, policy: Policy) -> Result<Policy, RepositoryError> {
        let mut state = self.state.lock().await;
        state.policies.push(policy.clone());
        Ok(policy)
    }

    async fn create_iam_policy(&self, policy: IamPolicy) -> Result<IamPolicy, RepositoryError> {
        let mut state = self.state.lock().await;
        if state
            .iam_policies
            .iter()
            .any(|p| p.org_id == policy.org_id && p.name == policy.name)
        {
            return Err(RepositoryError::Conflict(format!(
                "iam policy {} already exists for org {}",
                policy.name, policy.org_id
            )));
        }
        state.iam_policies.push(policy.clone());
        Ok(policy)
    }

    async fn create_rotation_schedule(&self, schedule: RotationSchedule) -> Result<RotationSchedule, RepositoryError> {
        let mut state = self.state.lock().await;
        if schedule.status == ScheduleStatus::Active
            && state.rotation_schedules.values().any(|s| {
                s.secret_id == schedule.secret_id && s.status == ScheduleStatus::Active
            })
        {
            return Err(RepositoryError::Conflict(format!(
                "secret {} already has an active rotation schedule",
                schedule.secret_id
            )));
        }
        state.rotation_schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<RotationSchedule>, RepositoryError> {
        let state = self.state.lock().await;
        let mut due: Vec<RotationSchedule> = state
            .rotation_schedules
            .values()
            .filter(|s| s.status == ScheduleStatus::Active && s.next_rotation_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_rotation_at);
        Ok(due)
    }

    async fn record_rotation_success(
        &self,
        schedule_id: Uuid,
        last_rotated_at: DateTime<Utc>,
        next_rotation_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let schedule = state
            .rotation_schedules
            .get_mut(&schedule_id)
            .ok_or(RepositoryError::NotFound)?;
        schedule.last_rotated_at = Some(last_rotated_at);
        schedule.next_rotation_at = next_rotation_at;
        schedule.status = ScheduleStatus::Active;
        schedule.last_error = None;
        Ok(())
    }

    async fn record_rotation_failure(&self, schedule_id: Uuid, error: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let schedule = state
            .rotation_schedules
            .get_mut(&schedule_id)
            .ok_or(RepositoryError::NotFound)?;
        schedule.status = ScheduleStatus::Failed;
        schedule.last_error = Some(error.to_string());
        Ok(())
    }

    async fn insert_lease(&self, lease: Lease) -> Result<Lease, RepositoryError> {
        let mut state = self.state.lock().await;
        state.leases.insert(lease.id, lease.clone());
        Ok(lease)
    }

    async fn get_lease(&self, id: Uuid) -> Result<Option<Lease>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.leases.get(&id).cloned())
    }

    async fn list_active_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.leases.values().filter(|l| l.is_active(now)).cloned().collect())
    }

    async fn revoke_lease(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&id) {
            Some(lease) if lease.is_active(now) => {
                lease.revoked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_all_due_leases(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        let mut count = 0u64;
        for lease in state.leases.values_mut() {
            if lease.revoked_at.is_none() && lease.expires_at <= now {
                lease.revoked_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn append_replication_entry(&self, entry: ReplicationEntry) -> Result<ReplicationEntry, RepositoryError> {
        let mut state = self.state.lock().await;
        state.next_replication_id += 1;
        let entry = ReplicationEntry {
            id: state.next_replication_id,
            ..entry
        };
        state.replication_log.push(entry.clone());
        Ok(entry)
    }

    async fn pull_replication_entries(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<(Vec<ReplicationEntry>, bool), RepositoryError> {
        let state = self.state.lock().await;
        let mut matching: Vec<ReplicationEntry> = state
            .replication_log
            .iter()
            .filter(|e| e.id > after_id)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.id);
        let has_more = matching.len() as i64 > limit;
        matching.truncate(limit as usize);
        Ok((matching, has_more))
    }

    async fn recent_entries_for_row(
        &self,
        table: &str,
        row_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReplicationEntry>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .replication_log
            .iter()
            .filter(|e| e.table == table && e.row_id == row_id && e.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn apply_replication_entry(&self, entry: ReplicationEntry) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        if state.replication_log.iter().any(|e| e.id == entry.id) {
            return Ok(false);
        }
        state.replication_log.push(entry);
        Ok(true)
    }

    async fn create_webhook(&self, webhook: Webhook) -> Result<Webhook, RepositoryError> {
        let mut state = self.state.lock().await;
        state.webhooks.insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    async fn list_active_webhooks_for_org(&self, org_id: Uuid, event: &str) -> Result<Vec<Webhook>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .webhooks
            .values()
            .filter(|w| w.org_id == org_id && w.active && w.subscribed_events.iter().any(|e| e == event))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> EnvelopeFields {
        EnvelopeFields {
            ciphertext: vec![1, 2, 3],
            nonce: vec![0; 12],
            wrapped_dek: vec![4, 5, 6],
            wrapped_dek_nonce: vec![0; 12],
            root_key_generation: 0,
        }
    }

    #[tokio::test]
    async fn put_secret_version_creates_gap_free_versions() {
        let repo = MemoryRepository::new();
        let project = repo.create_project("demo", None, None, "alice").await.unwrap();

        let (secret, v1) = repo
            .put_secret_version(project.id, "db/url", SecretType::Kv, envelope(), "alice")
            .await
            .unwrap();
        assert_eq!(v1.version, 1);

        let (_, v2) = repo
            .put_secret_version(project.id, "db/url", SecretType::Kv, envelope(), "alice")
            .await
            .unwrap();
        assert_eq!(v2.version, 2);

        let versions = repo.list_versions(secret.id).await.unwrap();
        assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn soft_deleted_secret_is_not_returned() {
        let repo = MemoryRepository::new();
        let project = repo.create_project("demo", None, None, "alice").await.unwrap();
        repo.put_secret_version(project.id, "db/url", SecretType::Kv, envelope(), "alice")
            .await
            .unwrap();

        repo.soft_delete_secret(project.id, "db/url").await.unwrap();
        assert!(repo.get_secret(project.id, "db/url").await.unwrap().is_none());
        assert!(matches!(
            repo.soft_delete_secret(project.id, "db/url").await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn lease_expiry_sweep_revokes_due_leases() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        let lease = Lease {
            id: Uuid::new_v4(),
            org_id: None,
            path: "database/app".into(),
            lease_type: "database".into(),
            wrapped_credential: vec![],
            nonce: vec![],
            wrapped_dek: vec![],
            wrapped_dek_nonce: vec![],
            root_key_generation: 0,
            issuer: "alice".into(),
            issued_at: now,
            expires_at: now - chrono::Duration::seconds(1),
            revoked_at: None,
        };
        repo.insert_lease(lease.clone()).await.unwrap();

        let expired = repo.expire_all_due_leases(now).await.unwrap();
        assert_eq!(expired, 1);
        assert!(repo.list_active_leases(now).await.unwrap().is_empty());
        assert!(!repo.revoke_lease(lease.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn replication_pull_respects_limit_and_has_more() {
        let repo = MemoryRepository::new();
        for i in 0..5 {
            repo.append_replication_entry(ReplicationEntry {
                id: 0,
                op: teamvault_types::ReplicationOp::Insert,
                table: "secrets".into(),
                row_id: format!("row-{i}"),
                payload: serde_json::json!({}),
                timestamp: Utc::now(),
                node_id: "node-a".into(),
                vector_clock: teamvault_types::VectorClock::new(),
            })
            .await
            .unwrap();
        }

        let (page, has_more) = repo.pull_replication_entries(0, 3).await.unwrap();
        assert_eq!(page.len(), 3);
        assert!(has_more);

        let (rest, has_more) = repo.pull_replication_entries(page.last().unwrap().id, 3).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(!has_more);
    }
}
